//! Policy plugin contract: governance hooks that fire around action
//! execution. Each concrete policy declares which `(phase, kind)` pairs it
//! handles; the dispatcher consults attached bindings in priority order.

pub mod lb;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use drover_common::Result;

use crate::context::EngineContext;
use crate::models::{Action, ActionKind, Cluster, ClusterPolicy, HookPhase};

#[async_trait]
pub trait PolicyPlugin: Send + Sync {
    /// Registry key, `type-version`.
    fn type_key(&self) -> &'static str;

    /// Default binding priority for this policy type.
    fn priority(&self) -> i32;

    /// The `(phase, kind)` pairs this policy wants to intercept.
    fn targets(&self) -> Vec<(HookPhase, ActionKind)>;

    /// Profile type keys the policy applies to; empty = any.
    fn profile_types(&self) -> Vec<&'static str>;

    /// Spec validation. `validate_props=true` additionally checks referenced
    /// external resources, which may call out through drivers.
    async fn validate(&self, ctx: &EngineContext, validate_props: bool) -> Result<()>;

    /// Runs under the cluster lock of the attach action. Returns the
    /// per-binding data to persist (created resources and the like).
    async fn attach(&self, ctx: &EngineContext, cluster: &Cluster) -> Result<Value>;

    async fn detach(&self, ctx: &EngineContext, cluster: &Cluster) -> Result<()>;

    /// Before the action body. Reports problems by setting
    /// `action.data.status = CHECK_ERROR`, which aborts the body.
    async fn pre_op(&self, ctx: &EngineContext, cluster_id: Uuid, action: &mut Action)
    -> Result<()>;

    /// After the action body. Failures degrade the cluster to WARNING but do
    /// not revert the body.
    async fn post_op(
        &self,
        ctx: &EngineContext,
        cluster_id: Uuid,
        action: &mut Action,
    ) -> Result<()>;
}

pub fn handles(targets: &[(HookPhase, ActionKind)], phase: HookPhase, kind: ActionKind) -> bool {
    targets.iter().any(|(p, k)| *p == phase && *k == kind)
}

/// Hook firing order: priority ascending, ties broken by attachment time.
pub fn order_bindings(mut bindings: Vec<ClusterPolicy>) -> Vec<ClusterPolicy> {
    bindings.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding(priority: i32, created_at: i64) -> ClusterPolicy {
        ClusterPolicy {
            cluster_id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            priority,
            level: 0,
            cooldown: 0,
            enabled: true,
            data: json!({}),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn bindings_order_by_priority_then_attach_time() {
        let a = binding(100, 5);
        let b = binding(50, 9);
        let c = binding(50, 3);
        let ordered = order_bindings(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(
            ordered.iter().map(|x| x.policy_id).collect::<Vec<_>>(),
            vec![c.policy_id, b.policy_id, a.policy_id]
        );
    }

    #[test]
    fn target_matching_is_exact_on_phase_and_kind() {
        let targets = vec![
            (HookPhase::Before, ActionKind::ClusterScaleIn),
            (HookPhase::After, ActionKind::ClusterScaleOut),
        ];
        assert!(handles(&targets, HookPhase::Before, ActionKind::ClusterScaleIn));
        assert!(!handles(&targets, HookPhase::After, ActionKind::ClusterScaleIn));
        assert!(!handles(&targets, HookPhase::Before, ActionKind::ClusterScaleOut));
    }
}
