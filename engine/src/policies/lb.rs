//! Load-balancer membership policy. Keeps an LBaaS pool in sync with the
//! membership of the cluster it is attached to: attach creates the balancer
//! and enrolls existing members, the BEFORE hooks pull delete-candidates out
//! of the pool before they are destroyed, the AFTER hooks enroll newly
//! created nodes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, Result};

use crate::context::EngineContext;
use crate::db;
use crate::drivers::{HealthMonitorSpec, LoadBalancerResources, PoolSpec, VipSpec};
use crate::models::{
    Action, ActionInputs, ActionKind, CheckStatus, Cluster, DeletionPlan, HookPhase,
};
use crate::profiles::server;
use crate::scaling;

use super::PolicyPlugin;

pub const TYPE_KEY: &str = "loadbalance.membership-1.0";
pub const PRIORITY: i32 = 500;

const PROTOCOLS: &[&str] = &["HTTP", "HTTPS", "TCP"];
const LB_METHODS: &[&str] = &["ROUND_ROBIN", "LEAST_CONNECTIONS", "SOURCE_IP"];
const HM_TYPES: &[&str] = &["PING", "TCP", "HTTP", "HTTPS"];
const PERSISTENCE_TYPES: &[&str] = &["SOURCE_IP", "HTTP_COOKIE", "APP_COOKIE"];

/// Node-data key where each member's pool membership id is kept.
const LB_MEMBER: &str = "lb_member";
/// Cluster-data key mapping policy id -> vip address.
const LOADBALANCERS: &str = "loadbalancers";

fn default_status_timeout() -> u32 {
    300
}

#[derive(Debug, Deserialize)]
struct Properties {
    pool: PoolSpec,
    vip: VipSpec,
    #[serde(default)]
    health_monitor: Option<HealthMonitorSpec>,
    #[serde(default = "default_status_timeout")]
    lb_status_timeout: u32,
}

pub struct LoadBalancingPolicy {
    policy_id: Uuid,
    pool_spec: PoolSpec,
    vip_spec: VipSpec,
    hm_spec: Option<HealthMonitorSpec>,
    #[allow(dead_code)]
    lb_status_timeout: u32,
}

pub fn factory(policy: &crate::models::Policy) -> Result<Box<dyn PolicyPlugin>> {
    let properties = policy.spec.get("properties").cloned().unwrap_or(json!({}));
    let properties: Properties = serde_json::from_value(properties)
        .map_err(|e| Error::InvalidSpec(format!("bad load-balancing policy spec: {e}")))?;
    Ok(Box::new(LoadBalancingPolicy {
        policy_id: policy.id,
        pool_spec: properties.pool,
        vip_spec: properties.vip,
        hm_spec: properties.health_monitor,
        lb_status_timeout: properties.lb_status_timeout,
    }))
}

pub fn schema() -> Value {
    json!({
        "pool": {
            "type": "object", "required": true,
            "properties": {
                "protocol": {"type": "string", "enum": PROTOCOLS, "default": "HTTP"},
                "protocol_port": {"type": "integer", "default": 80},
                "subnet": {"type": "string", "required": true},
                "lb_method": {"type": "string", "enum": LB_METHODS, "default": "ROUND_ROBIN"},
                "admin_state_up": {"type": "boolean", "default": true},
                "session_persistence": {"type": "object"},
            },
        },
        "vip": {
            "type": "object", "required": true,
            "properties": {
                "subnet": {"type": "string", "required": true},
                "address": {"type": "string"},
                "connection_limit": {"type": "integer", "default": -1},
                "protocol": {"type": "string", "enum": PROTOCOLS, "default": "HTTP"},
                "protocol_port": {"type": "integer", "default": 80},
                "admin_state_up": {"type": "boolean", "default": true},
            },
        },
        "health_monitor": {
            "type": "object",
            "properties": {
                "type": {"type": "string", "enum": HM_TYPES, "default": "PING"},
                "delay": {"type": "integer", "default": 10},
                "timeout": {"type": "integer", "default": 5},
                "max_retries": {"type": "integer", "default": 3},
            },
        },
        "lb_status_timeout": {"type": "integer", "default": 300},
    })
}

/// What the pure part of delete-candidate resolution can conclude without
/// touching the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidates {
    /// The victim set is already decided.
    Chosen(Vec<Uuid>),
    /// Only the victim count is known; somebody must pick.
    Count(u32),
    /// A resize whose shrink count must be computed against current size.
    FromResize,
    /// Not a deletion-flavored action.
    NotApplicable,
}

/// Resolution chain, in order: an existing deletion plan wins; otherwise the
/// kind dictates where candidates come from.
pub fn planned_candidates(action: &Action) -> Candidates {
    if let Some(ref deletion) = action.data.deletion {
        return match deletion.candidates {
            Some(ref chosen) => Candidates::Chosen(chosen.clone()),
            None => Candidates::Count(deletion.count),
        };
    }
    match &action.inputs {
        ActionInputs::NodeDelete => Candidates::Chosen(vec![action.target]),
        ActionInputs::ClusterDelNodes { nodes } => Candidates::Chosen(nodes.clone()),
        ActionInputs::ClusterResize { .. } => Candidates::FromResize,
        ActionInputs::ClusterScaleIn { count } => {
            Candidates::Count(count.map(|c| c.max(0) as u32).unwrap_or(1))
        }
        _ => Candidates::NotApplicable,
    }
}

impl LoadBalancingPolicy {
    async fn binding_resources(
        &self,
        ctx: &EngineContext,
        cluster_id: Uuid,
    ) -> Result<Option<LoadBalancerResources>> {
        let Some(binding) = db::policies::binding_get(&ctx.pool, cluster_id, self.policy_id).await?
        else {
            return Ok(None);
        };
        if binding.data.is_null() || binding.data == json!({}) {
            return Ok(None);
        }
        let resources: LoadBalancerResources = serde_json::from_value(binding.data)
            .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt binding data: {e}")))?;
        Ok(Some(resources))
    }

    /// Turn the pure resolution into a concrete victim list, choosing (and
    /// persisting) randomly where no plan exists yet.
    async fn delete_candidates(
        &self,
        ctx: &EngineContext,
        cluster_id: Uuid,
        action: &mut Action,
    ) -> Result<Vec<Uuid>> {
        let count = match planned_candidates(action) {
            Candidates::Chosen(chosen) => return Ok(chosen),
            Candidates::NotApplicable => return Ok(vec![]),
            Candidates::Count(count) => count,
            Candidates::FromResize => {
                let Some(cluster) = db::clusters::get(&ctx.pool, cluster_id, false).await? else {
                    return Ok(vec![]);
                };
                let current = db::nodes::count_by_cluster(&ctx.pool, cluster_id).await? as i32;
                let ActionInputs::ClusterResize {
                    adj_type,
                    number,
                    min_size,
                    max_size,
                    min_step,
                    strict,
                } = action.inputs.clone()
                else {
                    return Ok(vec![]);
                };
                let plan = match scaling::parse_resize_params(
                    &cluster, current, adj_type, number, min_size, max_size, min_step, strict,
                ) {
                    Ok(plan) => plan,
                    Err(e) => {
                        action.data.status = Some(CheckStatus::Error);
                        action.data.reason = Some(e.to_string());
                        return Ok(vec![]);
                    }
                };
                match plan.deletion {
                    // Growing or unchanged: nothing for this hook to do.
                    None => return Ok(vec![]),
                    Some(deletion) => {
                        let count = deletion.count;
                        action.data.deletion = Some(deletion);
                        count
                    }
                }
            }
        };

        if count == 0 {
            return Ok(vec![]);
        }
        let members = db::nodes::members(&ctx.pool, cluster_id).await?;
        let chosen = scaling::choose_candidates(&members, count as usize);
        action.data.deletion = Some(DeletionPlan {
            count: chosen.len() as u32,
            candidates: Some(chosen.clone()),
        });
        // Persist so the body deletes exactly the set we pulled out of the
        // pool, even on another engine.
        db::actions::update_data(&ctx.pool, action.id, &action.data).await?;
        Ok(chosen)
    }

    async fn remove_members(
        &self,
        ctx: &EngineContext,
        candidates: &[Uuid],
        resources: &LoadBalancerResources,
    ) -> Result<Vec<Uuid>> {
        let mut failed = vec![];
        for node_id in candidates {
            let Some(mut node) = db::nodes::get(&ctx.pool, *node_id, false).await? else {
                continue;
            };
            let Some(member_id) = node.data.get(LB_MEMBER).and_then(|v| v.as_str()).map(String::from)
            else {
                tracing::warn!(node = %node_id, pool = %resources.pool, "node not found in lb pool");
                continue;
            };
            match ctx
                .drivers
                .loadbalancer
                .member_remove(&resources.loadbalancer, &resources.pool, &member_id)
                .await
            {
                Ok(()) => {
                    if let Some(map) = node.data.as_object_mut() {
                        map.remove(LB_MEMBER);
                    }
                    db::nodes::update_data(&ctx.pool, node.id, &node.data).await?;
                }
                Err(e) => {
                    tracing::warn!(node = %node_id, error = %e, "failed to remove lb member");
                    failed.push(*node_id);
                    db::nodes::update_status(
                        &ctx.pool,
                        node.id,
                        crate::models::NodeStatus::Warning,
                        "Failed in removing node from lb pool",
                    )
                    .await?;
                }
            }
        }
        Ok(failed)
    }

    async fn add_members(
        &self,
        ctx: &EngineContext,
        additions: &[Uuid],
        resources: &LoadBalancerResources,
    ) -> Result<Vec<Uuid>> {
        let port = self.pool_spec.protocol_port;
        let subnet = self.pool_spec.subnet.clone();
        let mut failed = vec![];
        for node_id in additions {
            let Some(mut node) = db::nodes::get(&ctx.pool, *node_id, false).await? else {
                continue;
            };
            if node.data.get(LB_MEMBER).is_some() {
                tracing::warn!(node = %node_id, pool = %resources.pool, "node already in lb pool");
                continue;
            }
            match ctx
                .drivers
                .loadbalancer
                .member_add(&resources.loadbalancer, &resources.pool, node.id, port, &subnet)
                .await
            {
                Ok(member_id) => {
                    node.data[LB_MEMBER] = json!(member_id);
                    db::nodes::update_data(&ctx.pool, node.id, &node.data).await?;
                }
                Err(e) => {
                    tracing::warn!(node = %node_id, error = %e, "failed to add lb member");
                    failed.push(*node_id);
                    db::nodes::update_status(
                        &ctx.pool,
                        node.id,
                        crate::models::NodeStatus::Warning,
                        "Failed in adding node into lb pool",
                    )
                    .await?;
                }
            }
        }
        Ok(failed)
    }
}

#[async_trait]
impl PolicyPlugin for LoadBalancingPolicy {
    fn type_key(&self) -> &'static str {
        TYPE_KEY
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    fn targets(&self) -> Vec<(HookPhase, ActionKind)> {
        vec![
            (HookPhase::After, ActionKind::ClusterAddNodes),
            (HookPhase::After, ActionKind::ClusterScaleOut),
            (HookPhase::After, ActionKind::ClusterResize),
            (HookPhase::After, ActionKind::NodeCreate),
            (HookPhase::Before, ActionKind::ClusterDelNodes),
            (HookPhase::Before, ActionKind::ClusterScaleIn),
            (HookPhase::Before, ActionKind::ClusterResize),
            (HookPhase::Before, ActionKind::NodeDelete),
        ]
    }

    fn profile_types(&self) -> Vec<&'static str> {
        vec![server::TYPE_KEY]
    }

    async fn validate(&self, _ctx: &EngineContext, validate_props: bool) -> Result<()> {
        if !PROTOCOLS.contains(&self.pool_spec.protocol.as_str()) {
            return Err(Error::InvalidSpec(format!(
                "pool protocol '{}' is not one of {PROTOCOLS:?}",
                self.pool_spec.protocol
            )));
        }
        if !LB_METHODS.contains(&self.pool_spec.lb_method.as_str()) {
            return Err(Error::InvalidSpec(format!(
                "lb_method '{}' is not one of {LB_METHODS:?}",
                self.pool_spec.lb_method
            )));
        }
        if let Some(ref persistence) = self.pool_spec.session_persistence
            && !PERSISTENCE_TYPES.contains(&persistence.kind.as_str())
        {
            return Err(Error::InvalidSpec(format!(
                "session persistence type '{}' is not one of {PERSISTENCE_TYPES:?}",
                persistence.kind
            )));
        }
        if let Some(ref hm) = self.hm_spec
            && !HM_TYPES.contains(&hm.kind.as_str())
        {
            return Err(Error::InvalidSpec(format!(
                "health monitor type '{}' is not one of {HM_TYPES:?}",
                hm.kind
            )));
        }
        if validate_props {
            if self.pool_spec.subnet.trim().is_empty() {
                return Err(Error::InvalidSpec("pool subnet must not be empty".into()));
            }
            if self.vip_spec.subnet.trim().is_empty() {
                return Err(Error::InvalidSpec("vip subnet must not be empty".into()));
            }
        }
        Ok(())
    }

    async fn attach(&self, ctx: &EngineContext, cluster: &Cluster) -> Result<Value> {
        let members = db::nodes::members(&ctx.pool, cluster.id).await?;

        let resources = ctx
            .drivers
            .loadbalancer
            .lb_create(&self.vip_spec, &self.pool_spec, self.hm_spec.as_ref())
            .await
            .map_err(Error::Internal)?;

        let port = self.pool_spec.protocol_port;
        for node in &members {
            let member_id = match ctx
                .drivers
                .loadbalancer
                .member_add(
                    &resources.loadbalancer,
                    &resources.pool,
                    node.id,
                    port,
                    &self.pool_spec.subnet,
                )
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    // Roll the balancer back; a half-enrolled pool is worse
                    // than no pool.
                    let _ = ctx.drivers.loadbalancer.lb_delete(&resources).await;
                    return Err(Error::Internal(
                        e.context("failed in adding node into lb pool"),
                    ));
                }
            };
            let mut data = node.data.clone();
            data[LB_MEMBER] = json!(member_id);
            db::nodes::update_data(&ctx.pool, node.id, &data).await?;
        }

        let mut cluster_data = cluster.data.clone();
        if !cluster_data.is_object() {
            cluster_data = json!({});
        }
        cluster_data[LOADBALANCERS][self.policy_id.to_string()] =
            json!({"vip_address": resources.vip_address});
        db::clusters::update_data(&ctx.pool, cluster.id, &cluster_data).await?;

        serde_json::to_value(&resources).map_err(|e| Error::Internal(e.into()))
    }

    async fn detach(&self, ctx: &EngineContext, cluster: &Cluster) -> Result<()> {
        let Some(resources) = self.binding_resources(ctx, cluster.id).await? else {
            return Ok(());
        };

        ctx.drivers
            .loadbalancer
            .lb_delete(&resources)
            .await
            .map_err(Error::Internal)?;

        for node in db::nodes::members(&ctx.pool, cluster.id).await? {
            if node.data.get(LB_MEMBER).is_some() {
                let mut data = node.data.clone();
                if let Some(map) = data.as_object_mut() {
                    map.remove(LB_MEMBER);
                }
                db::nodes::update_data(&ctx.pool, node.id, &data).await?;
            }
        }

        let mut cluster_data = cluster.data.clone();
        let mut emptied = false;
        if let Some(lbs) = cluster_data.get_mut(LOADBALANCERS).and_then(|v| v.as_object_mut()) {
            lbs.remove(&self.policy_id.to_string());
            emptied = lbs.is_empty();
        }
        if emptied {
            if let Some(map) = cluster_data.as_object_mut() {
                map.remove(LOADBALANCERS);
            }
        }
        db::clusters::update_data(&ctx.pool, cluster.id, &cluster_data).await?;
        Ok(())
    }

    async fn pre_op(
        &self,
        ctx: &EngineContext,
        cluster_id: Uuid,
        action: &mut Action,
    ) -> Result<()> {
        let candidates = self.delete_candidates(ctx, cluster_id, action).await?;
        if candidates.is_empty() || action.data.check_failed() {
            return Ok(());
        }

        let Some(resources) = self.binding_resources(ctx, cluster_id).await? else {
            return Ok(());
        };
        let failed = self.remove_members(ctx, &candidates, &resources).await?;
        if !failed.is_empty() {
            action.data.status = Some(CheckStatus::Error);
            action.data.reason = Some(format!(
                "failed in removing deleted node(s) from lb pool: {failed:?}"
            ));
        }
        Ok(())
    }

    async fn post_op(
        &self,
        ctx: &EngineContext,
        cluster_id: Uuid,
        action: &mut Action,
    ) -> Result<()> {
        let additions: Vec<Uuid> = if action.kind == ActionKind::NodeCreate {
            vec![action.target]
        } else {
            match action.data.creation {
                Some(ref creation) => creation.nodes.clone(),
                None => vec![],
            }
        };
        if additions.is_empty() {
            return Ok(());
        }

        let Some(resources) = self.binding_resources(ctx, cluster_id).await? else {
            return Ok(());
        };
        let failed = self.add_members(ctx, &additions, &resources).await?;
        if !failed.is_empty() {
            action.data.status = Some(CheckStatus::Error);
            action.data.reason = Some(format!("failed in adding nodes into lb pool: {failed:?}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionCause, ActionData, ActionStatus, AdjustmentType};

    fn action(inputs: ActionInputs, data: ActionData) -> Action {
        let kind = inputs.kind();
        Action {
            id: Uuid::new_v4(),
            name: "test".into(),
            target: Uuid::new_v4(),
            kind,
            cause: ActionCause::Rpc,
            owner: None,
            start_time: None,
            end_time: None,
            timeout: 3600,
            status: ActionStatus::Running,
            status_reason: String::new(),
            signal: None,
            inputs,
            outputs: json!({}),
            data,
            attempts: 1,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn existing_deletion_plan_wins() {
        let chosen = vec![Uuid::new_v4(), Uuid::new_v4()];
        let a = action(
            ActionInputs::ClusterScaleIn { count: Some(5) },
            ActionData {
                deletion: Some(DeletionPlan {
                    count: 2,
                    candidates: Some(chosen.clone()),
                }),
                ..Default::default()
            },
        );
        assert_eq!(planned_candidates(&a), Candidates::Chosen(chosen));
    }

    #[test]
    fn deletion_plan_without_victims_keeps_only_the_count() {
        let a = action(
            ActionInputs::ClusterScaleIn { count: None },
            ActionData {
                deletion: Some(DeletionPlan {
                    count: 3,
                    candidates: None,
                }),
                ..Default::default()
            },
        );
        assert_eq!(planned_candidates(&a), Candidates::Count(3));
    }

    #[test]
    fn node_delete_targets_itself() {
        let a = action(ActionInputs::NodeDelete, ActionData::default());
        assert_eq!(planned_candidates(&a), Candidates::Chosen(vec![a.target]));
    }

    #[test]
    fn del_nodes_takes_inputs() {
        let nodes = vec![Uuid::new_v4()];
        let a = action(
            ActionInputs::ClusterDelNodes { nodes: nodes.clone() },
            ActionData::default(),
        );
        assert_eq!(planned_candidates(&a), Candidates::Chosen(nodes));
    }

    #[test]
    fn scale_in_defaults_to_one() {
        let a = action(ActionInputs::ClusterScaleIn { count: None }, ActionData::default());
        assert_eq!(planned_candidates(&a), Candidates::Count(1));
    }

    #[test]
    fn resize_defers_to_size_arithmetic() {
        let a = action(
            ActionInputs::ClusterResize {
                adj_type: Some(AdjustmentType::ExactCapacity),
                number: Some(1.0),
                min_size: None,
                max_size: None,
                min_step: None,
                strict: true,
            },
            ActionData::default(),
        );
        assert_eq!(planned_candidates(&a), Candidates::FromResize);
    }

    #[test]
    fn additive_actions_are_not_applicable() {
        let a = action(
            ActionInputs::ClusterScaleOut { count: Some(1) },
            ActionData::default(),
        );
        assert_eq!(planned_candidates(&a), Candidates::NotApplicable);
    }
}
