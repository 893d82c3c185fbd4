//! Bodies for the NODE_* action kinds. Each one resolves the node's profile
//! plugin and drives the compute seam, then settles the node row.

use drover_common::{Error, Result};

use crate::db;
use crate::models::{Action, ActionInputs, NodeStatus, Profile};

use super::{Outcome, Runner};

async fn require_node(runner: &Runner<'_>, action: &Action) -> Result<Option<crate::models::Node>> {
    db::nodes::get(&runner.ctx.pool, action.target, false).await
}

async fn profile_of(runner: &Runner<'_>, profile_id: uuid::Uuid) -> Result<Profile> {
    db::profiles::get(&runner.ctx.pool, profile_id, true)
        .await?
        .ok_or(Error::NotFound {
            kind: "profile",
            id: profile_id.to_string(),
        })
}

pub async fn do_create(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let Some(node) = require_node(runner, action).await? else {
        return Ok(Outcome::failed("node not found"));
    };
    db::nodes::update_status(pool, node.id, NodeStatus::Creating, "provisioning").await?;

    let profile = profile_of(runner, node.profile_id).await?;
    let plugin = runner.ctx.env.new_profile(&profile.type_name, &profile.spec)?;
    match plugin.create_node(runner.ctx, &node).await {
        Ok(physical_id) => {
            db::nodes::set_provisioned(pool, node.id, &physical_id).await?;
            Ok(Outcome::ok_with(
                "node created",
                serde_json::json!({"physical_id": physical_id}),
            ))
        }
        Err(Error::Internal(e)) => {
            db::nodes::update_status(pool, node.id, NodeStatus::Error, "provisioning failed")
                .await?;
            Err(Error::Internal(e))
        }
        Err(e) => {
            db::nodes::update_status(pool, node.id, NodeStatus::Error, &e.to_string()).await?;
            Ok(Outcome::failed(e.to_string()))
        }
    }
}

pub async fn do_delete(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let Some(node) = require_node(runner, action).await? else {
        // Idempotent: deleting a gone node is not an error.
        return Ok(Outcome::ok("node already deleted"));
    };
    db::nodes::update_status(pool, node.id, NodeStatus::Deleting, "deprovisioning").await?;

    let profile = profile_of(runner, node.profile_id).await?;
    let plugin = runner.ctx.env.new_profile(&profile.type_name, &profile.spec)?;
    match plugin.delete_node(runner.ctx, &node).await {
        Ok(()) => {
            db::nodes::soft_delete(pool, node.id).await?;
            Ok(Outcome::ok("node deleted"))
        }
        Err(Error::Internal(e)) => {
            db::nodes::update_status(pool, node.id, NodeStatus::Error, "deprovisioning failed")
                .await?;
            Err(Error::Internal(e))
        }
        Err(e) => {
            db::nodes::update_status(pool, node.id, NodeStatus::Error, &e.to_string()).await?;
            Ok(Outcome::failed(e.to_string()))
        }
    }
}

pub async fn do_update(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::NodeUpdate {
        new_profile_id,
        ref name,
        ref role,
        ref metadata,
    } = action.inputs
    else {
        return Ok(Outcome::failed("malformed inputs for NODE_UPDATE"));
    };
    let (name, role, metadata) = (name.clone(), role.clone(), metadata.clone());
    let Some(mut node) = require_node(runner, action).await? else {
        return Ok(Outcome::failed("node not found"));
    };
    db::nodes::update_status(pool, node.id, NodeStatus::Updating, "update in progress").await?;

    if let Some(new_profile_id) = new_profile_id
        && new_profile_id != node.profile_id
    {
        let new_profile = profile_of(runner, new_profile_id).await?;
        let plugin = runner
            .ctx
            .env
            .new_profile(&new_profile.type_name, &new_profile.spec)?;
        match plugin.update_node(runner.ctx, &node, &new_profile.spec).await {
            Ok(()) => node.profile_id = new_profile_id,
            Err(Error::Internal(e)) => {
                db::nodes::update_status(pool, node.id, NodeStatus::Error, "update failed").await?;
                return Err(Error::Internal(e));
            }
            Err(e) => {
                db::nodes::update_status(pool, node.id, NodeStatus::Error, &e.to_string()).await?;
                return Ok(Outcome::failed(e.to_string()));
            }
        }
    }

    if let Some(name) = name {
        node.name = name;
    }
    if let Some(role) = role {
        node.role = Some(role);
    }
    if let Some(metadata) = metadata {
        node.metadata = metadata;
    }
    node.status = NodeStatus::Active;
    node.status_reason = "update succeeded".into();
    db::nodes::update(pool, &node).await?;
    Ok(Outcome::ok("node updated"))
}

pub async fn do_join(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let ActionInputs::NodeJoin { cluster_id } = action.inputs else {
        return Ok(Outcome::failed("malformed inputs for NODE_JOIN"));
    };
    let Some(node) = require_node(runner, action).await? else {
        return Ok(Outcome::failed("node not found"));
    };
    if node.cluster_id.is_some() {
        return Ok(Outcome::failed("node already belongs to a cluster"));
    }
    let cluster = super::require_cluster(runner, cluster_id).await?;

    // The façade validated profile types, but the cluster may have been
    // profile-updated since; check against current state.
    let node_profile = profile_of(runner, node.profile_id).await?;
    let cluster_profile = profile_of(runner, cluster.profile_id).await?;
    if node_profile.type_name != cluster_profile.type_name {
        return Ok(Outcome::failed(
            "node and cluster have different profile types",
        ));
    }

    let index = db::nodes::next_index(pool, cluster.id).await?;
    db::nodes::set_membership(pool, node.id, Some(cluster.id), index).await?;
    Ok(Outcome::ok(format!("node joined cluster {}", cluster.name)))
}

pub async fn do_leave(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;
    let Some(node) = require_node(runner, action).await? else {
        return Ok(Outcome::failed("node not found"));
    };
    if node.cluster_id.is_none() {
        return Ok(Outcome::ok("node is already an orphan"));
    }
    db::nodes::set_membership(pool, node.id, None, -1).await?;
    Ok(Outcome::ok("node left cluster"))
}
