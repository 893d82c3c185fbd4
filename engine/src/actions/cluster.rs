//! Bodies for the CLUSTER_* action kinds. All run under the cluster lock;
//! node-level work is delegated to derived NODE_* actions that other workers
//! pick up in parallel.

use serde_json::json;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::db;
use crate::models::{
    Action, ActionInputs, Cluster, ClusterPolicy, ClusterStatus, CreationPlan, Node, NodeStatus,
    short_id,
};

use super::{ChildWait, Outcome, Runner, require_cluster, spawn_child, wait_for_children};

/// Create node rows and derived NODE_CREATE actions to grow `cluster` by
/// `count` members. Returns (child action ids, node ids).
async fn grow(
    runner: &Runner<'_>,
    cluster: &Cluster,
    count: u32,
) -> Result<(Vec<Uuid>, Vec<Uuid>)> {
    let pool = &runner.ctx.pool;
    let mut children = Vec::with_capacity(count as usize);
    let mut node_ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let index = db::nodes::next_index(pool, cluster.id).await?;
        let now = now_ms();
        let node = Node {
            id: Uuid::new_v4(),
            name: format!("{}-node-{:03}", cluster.name, index),
            profile_id: cluster.profile_id,
            cluster_id: Some(cluster.id),
            role: None,
            index,
            status: NodeStatus::Init,
            status_reason: "waiting for provisioning".into(),
            physical_id: None,
            user: cluster.user.clone(),
            project: cluster.project.clone(),
            domain: cluster.domain.clone(),
            metadata: json!({}),
            data: json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::nodes::insert(pool, &node).await?;
        node_ids.push(node.id);
        children.push(
            spawn_child(
                runner,
                "node_create",
                node.id,
                ActionInputs::NodeCreate,
                cluster.timeout,
            )
            .await?,
        );
    }
    Ok((children, node_ids))
}

/// Spawn NODE_DELETE children for the given members.
async fn shrink(runner: &Runner<'_>, cluster: &Cluster, victims: &[Uuid]) -> Result<Vec<Uuid>> {
    let mut children = Vec::with_capacity(victims.len());
    for node_id in victims {
        children.push(
            spawn_child(
                runner,
                "node_delete",
                *node_id,
                ActionInputs::NodeDelete,
                cluster.timeout,
            )
            .await?,
        );
    }
    Ok(children)
}

pub async fn do_create(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let cluster = require_cluster(runner, action.target).await?;
    db::clusters::update_status(
        pool,
        cluster.id,
        ClusterStatus::Creating,
        "cluster creation in progress",
    )
    .await?;

    let current = db::nodes::count_by_cluster(pool, cluster.id).await? as i32;
    let need = (cluster.desired_capacity - current).max(0) as u32;
    let (children, node_ids) = grow(runner, &cluster, need).await?;

    action.data.creation = Some(CreationPlan {
        count: need,
        nodes: node_ids.clone(),
    });
    db::actions::update_data(pool, action.id, &action.data).await?;

    match wait_for_children(runner, action, &children).await? {
        ChildWait::AllSucceeded => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Active,
                "cluster creation succeeded",
            )
            .await?;
            Ok(Outcome::ok_with(
                "cluster creation succeeded",
                json!({"nodes": node_ids}),
            ))
        }
        ChildWait::SomeFailed(failed) => {
            let reason = format!("{} of {} node creations failed", failed.len(), need);
            db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason).await?;
            Ok(Outcome::failed(reason))
        }
        ChildWait::Cancelled => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Error,
                "cluster creation cancelled",
            )
            .await?;
            Ok(Outcome::cancelled("cluster creation cancelled"))
        }
    }
}

pub async fn do_update(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterUpdate { new_profile_id } = action.inputs else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_UPDATE"));
    };
    let mut cluster = require_cluster(runner, action.target).await?;
    db::clusters::update_status(
        pool,
        cluster.id,
        ClusterStatus::Updating,
        "profile update in progress",
    )
    .await?;

    let members = db::nodes::members(pool, cluster.id).await?;
    let mut children = Vec::with_capacity(members.len());
    for member in &members {
        children.push(
            spawn_child(
                runner,
                "node_update",
                member.id,
                ActionInputs::NodeUpdate {
                    new_profile_id: Some(new_profile_id),
                    name: None,
                    role: None,
                    metadata: None,
                },
                cluster.timeout,
            )
            .await?,
        );
    }

    match wait_for_children(runner, action, &children).await? {
        ChildWait::AllSucceeded => {
            cluster.profile_id = new_profile_id;
            cluster.status = ClusterStatus::Active;
            cluster.status_reason = "profile update succeeded".into();
            db::clusters::update(pool, &cluster).await?;
            Ok(Outcome::ok("profile update succeeded"))
        }
        ChildWait::SomeFailed(failed) => {
            let reason = format!("{} of {} node updates failed", failed.len(), members.len());
            db::clusters::update_status(pool, cluster.id, ClusterStatus::Warning, &reason).await?;
            Ok(Outcome::failed(reason))
        }
        ChildWait::Cancelled => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Warning,
                "profile update cancelled",
            )
            .await?;
            Ok(Outcome::cancelled("profile update cancelled"))
        }
    }
}

pub async fn do_delete(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let cluster = require_cluster(runner, action.target).await?;
    db::clusters::update_status(
        pool,
        cluster.id,
        ClusterStatus::Deleting,
        "cluster deletion in progress",
    )
    .await?;

    let members = db::nodes::members(pool, cluster.id).await?;
    let victims: Vec<Uuid> = members.iter().map(|n| n.id).collect();
    let children = shrink(runner, &cluster, &victims).await?;

    match wait_for_children(runner, action, &children).await? {
        ChildWait::AllSucceeded => {
            db::health::remove_cluster_checks(pool, cluster.id).await?;
            db::clusters::soft_delete(pool, cluster.id).await?;
            Ok(Outcome::ok("cluster deletion succeeded"))
        }
        ChildWait::SomeFailed(failed) => {
            let reason = format!(
                "{} of {} node deletions failed",
                failed.len(),
                victims.len()
            );
            db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason).await?;
            Ok(Outcome::failed(reason))
        }
        ChildWait::Cancelled => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Error,
                "cluster deletion cancelled",
            )
            .await?;
            Ok(Outcome::cancelled("cluster deletion cancelled"))
        }
    }
}

pub async fn do_add_nodes(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterAddNodes { ref nodes } = action.inputs else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_ADD_NODES"));
    };
    let nodes = nodes.clone();
    let cluster = require_cluster(runner, action.target).await?;

    let mut added = vec![];
    for node_id in &nodes {
        let Some(node) = db::nodes::get(pool, *node_id, false).await? else {
            return Ok(Outcome::failed(format!("node {node_id} not found")));
        };
        if node.cluster_id.is_some() {
            return Ok(Outcome::failed(format!(
                "node {node_id} is owned by another cluster"
            )));
        }
        let index = db::nodes::next_index(pool, cluster.id).await?;
        db::nodes::set_membership(pool, node.id, Some(cluster.id), index).await?;
        added.push(node.id);
    }

    db::clusters::update_size(
        pool,
        cluster.id,
        cluster.desired_capacity + added.len() as i32,
        None,
        None,
    )
    .await?;
    action.data.creation = Some(CreationPlan {
        count: added.len() as u32,
        nodes: added.clone(),
    });
    db::actions::update_data(pool, action.id, &action.data).await?;
    Ok(Outcome::ok_with(
        "completed adding nodes",
        json!({"nodes": added}),
    ))
}

pub async fn do_del_nodes(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let cluster = require_cluster(runner, action.target).await?;
    // Victims were fixed before the hooks ran.
    let victims = action
        .data
        .deletion
        .as_ref()
        .and_then(|d| d.candidates.clone())
        .unwrap_or_default();

    let mut removed = 0;
    for node_id in &victims {
        let Some(node) = db::nodes::get(pool, *node_id, false).await? else {
            continue;
        };
        if node.cluster_id != Some(cluster.id) {
            continue;
        }
        // Leave the cluster; the node itself survives as an orphan.
        db::nodes::set_membership(pool, node.id, None, -1).await?;
        removed += 1;
    }

    db::clusters::update_size(
        pool,
        cluster.id,
        (cluster.desired_capacity - removed).max(0),
        None,
        None,
    )
    .await?;
    Ok(Outcome::ok_with(
        "completed deleting nodes",
        json!({"count": removed}),
    ))
}

pub async fn do_resize(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterResize {
        min_size, max_size, ..
    } = action.inputs
    else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_RESIZE"));
    };
    let cluster = require_cluster(runner, action.target).await?;
    let current = db::nodes::count_by_cluster(pool, cluster.id).await? as i32;

    // The plan was resolved before the hooks ran; hooks may have refined the
    // victim set.
    if let Some(creation) = action.data.creation.clone() {
        db::clusters::update_status(pool, cluster.id, ClusterStatus::Resizing, "growing cluster")
            .await?;
        let (children, node_ids) = grow(runner, &cluster, creation.count).await?;
        action.data.creation = Some(CreationPlan {
            count: creation.count,
            nodes: node_ids.clone(),
        });
        db::actions::update_data(pool, action.id, &action.data).await?;
        match wait_for_children(runner, action, &children).await? {
            ChildWait::AllSucceeded => {}
            ChildWait::SomeFailed(failed) => {
                let reason = format!("{} of {} node creations failed", failed.len(), creation.count);
                db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason)
                    .await?;
                return Ok(Outcome::failed(reason));
            }
            ChildWait::Cancelled => {
                db::clusters::update_status(
                    pool,
                    cluster.id,
                    ClusterStatus::Error,
                    "resize cancelled",
                )
                .await?;
                return Ok(Outcome::cancelled("resize cancelled"));
            }
        }
        let desired = current + creation.count as i32;
        db::clusters::update_size(pool, cluster.id, desired, min_size, max_size).await?;
        db::clusters::update_status(pool, cluster.id, ClusterStatus::Active, "resize succeeded")
            .await?;
        return Ok(Outcome::ok_with(
            "cluster resize succeeded",
            json!({"nodes": node_ids}),
        ));
    }

    if let Some(deletion) = action.data.deletion.clone() {
        let victims = deletion.candidates.unwrap_or_default();
        db::clusters::update_status(pool, cluster.id, ClusterStatus::Resizing, "shrinking cluster")
            .await?;
        let children = shrink(runner, &cluster, &victims).await?;
        match wait_for_children(runner, action, &children).await? {
            ChildWait::AllSucceeded => {}
            ChildWait::SomeFailed(failed) => {
                let reason =
                    format!("{} of {} node deletions failed", failed.len(), victims.len());
                db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason)
                    .await?;
                return Ok(Outcome::failed(reason));
            }
            ChildWait::Cancelled => {
                db::clusters::update_status(
                    pool,
                    cluster.id,
                    ClusterStatus::Error,
                    "resize cancelled",
                )
                .await?;
                return Ok(Outcome::cancelled("resize cancelled"));
            }
        }
        let desired = (current - victims.len() as i32).max(0);
        db::clusters::update_size(pool, cluster.id, desired, min_size, max_size).await?;
        db::clusters::update_status(pool, cluster.id, ClusterStatus::Active, "resize succeeded")
            .await?;
        return Ok(Outcome::ok("cluster resize succeeded"));
    }

    // Bounds-only resize.
    db::clusters::update_size(pool, cluster.id, cluster.desired_capacity, min_size, max_size)
        .await?;
    Ok(Outcome::ok("cluster size constraints updated"))
}

pub async fn do_scale_out(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterScaleOut { count } = action.inputs else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_SCALE_OUT"));
    };
    let cluster = require_cluster(runner, action.target).await?;
    let current = db::nodes::count_by_cluster(pool, cluster.id).await? as i32;
    let count = count.unwrap_or(1).max(1) as u32;

    let desired = current + count as i32;
    if cluster.max_size >= 0 && desired > cluster.max_size {
        return Ok(Outcome::failed(format!(
            "the target capacity ({desired}) is greater than the cluster's max_size ({})",
            cluster.max_size
        )));
    }

    db::clusters::update_status(pool, cluster.id, ClusterStatus::Resizing, "scaling out").await?;
    let (children, node_ids) = grow(runner, &cluster, count).await?;
    action.data.creation = Some(CreationPlan {
        count,
        nodes: node_ids.clone(),
    });
    db::actions::update_data(pool, action.id, &action.data).await?;

    match wait_for_children(runner, action, &children).await? {
        ChildWait::AllSucceeded => {
            db::clusters::update_size(pool, cluster.id, desired, None, None).await?;
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Active,
                "scale-out succeeded",
            )
            .await?;
            Ok(Outcome::ok_with(
                "cluster scale-out succeeded",
                json!({"nodes": node_ids}),
            ))
        }
        ChildWait::SomeFailed(failed) => {
            let reason = format!("{} of {count} node creations failed", failed.len());
            db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason).await?;
            Ok(Outcome::failed(reason))
        }
        ChildWait::Cancelled => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Error,
                "scale-out cancelled",
            )
            .await?;
            Ok(Outcome::cancelled("scale-out cancelled"))
        }
    }
}

pub async fn do_scale_in(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let cluster = require_cluster(runner, action.target).await?;
    let current = db::nodes::count_by_cluster(pool, cluster.id).await? as i32;
    let victims = action
        .data
        .deletion
        .as_ref()
        .and_then(|d| d.candidates.clone())
        .unwrap_or_default();

    let desired = current - victims.len() as i32;
    if desired < cluster.min_size {
        return Ok(Outcome::failed(format!(
            "the target capacity ({desired}) is less than the cluster's min_size ({})",
            cluster.min_size
        )));
    }

    db::clusters::update_status(pool, cluster.id, ClusterStatus::Resizing, "scaling in").await?;
    let children = shrink(runner, &cluster, &victims).await?;

    match wait_for_children(runner, action, &children).await? {
        ChildWait::AllSucceeded => {
            db::clusters::update_size(pool, cluster.id, desired.max(0), None, None).await?;
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Active,
                "scale-in succeeded",
            )
            .await?;
            Ok(Outcome::ok_with(
                "cluster scale-in succeeded",
                json!({"count": victims.len()}),
            ))
        }
        ChildWait::SomeFailed(failed) => {
            let reason = format!("{} of {} node deletions failed", failed.len(), victims.len());
            db::clusters::update_status(pool, cluster.id, ClusterStatus::Error, &reason).await?;
            Ok(Outcome::failed(reason))
        }
        ChildWait::Cancelled => {
            db::clusters::update_status(
                pool,
                cluster.id,
                ClusterStatus::Error,
                "scale-in cancelled",
            )
            .await?;
            Ok(Outcome::cancelled("scale-in cancelled"))
        }
    }
}

pub async fn do_attach_policy(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterAttachPolicy {
        policy_id,
        priority,
        level,
        cooldown,
        enabled,
    } = action.inputs
    else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_ATTACH_POLICY"));
    };
    let cluster = require_cluster(runner, action.target).await?;
    let Some(policy) = db::policies::get(pool, policy_id, false).await? else {
        return Ok(Outcome::failed(format!("policy {policy_id} not found")));
    };
    if db::policies::binding_get(pool, cluster.id, policy_id)
        .await?
        .is_some()
    {
        return Ok(Outcome::failed(format!(
            "policy {} is already attached to cluster {}",
            policy.name, cluster.name
        )));
    }

    let plugin = runner.ctx.env.new_policy(&policy)?;
    let applicable = plugin.profile_types();
    if !applicable.is_empty() {
        let Some(profile) = db::profiles::get(pool, cluster.profile_id, true).await? else {
            return Ok(Outcome::failed("cluster profile not found"));
        };
        if !applicable.contains(&profile.type_name.as_str()) {
            return Ok(Outcome::failed(format!(
                "policy {} is not applicable on profile type {}",
                policy.name, profile.type_name
            )));
        }
    }

    let data = match plugin.attach(runner.ctx, &cluster).await {
        Ok(data) => data,
        Err(Error::Internal(e)) => return Err(Error::Internal(e)),
        Err(e) => return Ok(Outcome::failed(e.to_string())),
    };

    let now = now_ms();
    db::policies::binding_insert(
        pool,
        &ClusterPolicy {
            cluster_id: cluster.id,
            policy_id,
            priority,
            level,
            cooldown,
            enabled,
            data,
            created_at: now,
            updated_at: now,
        },
    )
    .await?;
    Ok(Outcome::ok(format!(
        "policy {} attached",
        short_id(&policy_id)
    )))
}

pub async fn do_detach_policy(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterDetachPolicy { policy_id } = action.inputs else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_DETACH_POLICY"));
    };
    let cluster = require_cluster(runner, action.target).await?;
    let Some(policy) = db::policies::get(pool, policy_id, false).await? else {
        return Ok(Outcome::failed(format!("policy {policy_id} not found")));
    };
    if db::policies::binding_get(pool, cluster.id, policy_id)
        .await?
        .is_none()
    {
        return Ok(Outcome::failed(format!(
            "policy {} is not attached to cluster {}",
            policy.name, cluster.name
        )));
    }

    let plugin = runner.ctx.env.new_policy(&policy)?;
    match plugin.detach(runner.ctx, &cluster).await {
        Ok(()) => {}
        Err(Error::Internal(e)) => return Err(Error::Internal(e)),
        Err(e) => return Ok(Outcome::failed(e.to_string())),
    }
    db::policies::binding_delete(pool, cluster.id, policy_id).await?;
    Ok(Outcome::ok(format!(
        "policy {} detached",
        short_id(&policy_id)
    )))
}

pub async fn do_update_policy(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::ClusterUpdatePolicy {
        policy_id,
        priority,
        level,
        cooldown,
        enabled,
    } = action.inputs
    else {
        return Ok(Outcome::failed("malformed inputs for CLUSTER_UPDATE_POLICY"));
    };
    let cluster = require_cluster(runner, action.target).await?;
    if db::policies::binding_get(pool, cluster.id, policy_id)
        .await?
        .is_none()
    {
        return Ok(Outcome::failed(format!(
            "policy {policy_id} is not attached to cluster {}",
            cluster.name
        )));
    }
    db::policies::binding_update(pool, cluster.id, policy_id, priority, level, cooldown, enabled)
        .await?;
    Ok(Outcome::ok("policy binding updated"))
}
