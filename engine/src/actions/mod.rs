//! Action execution: lock planning and acquisition, the pre-hook / body /
//! post-hook sequence, child-action orchestration, and outcome recording.
//! A worker hands a freshly claimed action to [`process`]; everything after
//! that point is driven from here.

mod cluster;
mod node;

use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_common::{Result, now_ms, wait};

use crate::context::EngineContext;
use crate::db;
use crate::models::{
    Action, ActionCause, ActionInputs, ActionKind, ActionSignal, ActionStatus, Cluster,
    ClusterStatus, DeletionPlan, EventLevel, HookPhase, short_id,
};
use crate::policies;
use crate::scaling;

/// Execution context of one worker.
pub struct Runner<'a> {
    pub ctx: &'a EngineContext,
    pub engine_id: Uuid,
    pub cancel: &'a CancellationToken,
}

/// Terminal result of driving an action body.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { reason: String, outputs: Value },
    Failed { reason: String },
    Cancelled { reason: String },
}

impl Outcome {
    pub fn ok(reason: impl Into<String>) -> Self {
        Outcome::Succeeded {
            reason: reason.into(),
            outputs: json!({}),
        }
    }

    pub fn ok_with(reason: impl Into<String>, outputs: Value) -> Self {
        Outcome::Succeeded {
            reason: reason.into(),
            outputs,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Outcome::Cancelled {
            reason: reason.into(),
        }
    }

    fn status(&self) -> ActionStatus {
        match self {
            Outcome::Succeeded { .. } => ActionStatus::Succeeded,
            Outcome::Failed { .. } => ActionStatus::Failed,
            Outcome::Cancelled { .. } => ActionStatus::Cancelled,
        }
    }

    fn reason(&self) -> &str {
        match self {
            Outcome::Succeeded { reason, .. }
            | Outcome::Failed { reason }
            | Outcome::Cancelled { reason } => reason,
        }
    }

    fn outputs(&self) -> Value {
        match self {
            Outcome::Succeeded { outputs, .. } => outputs.clone(),
            Outcome::Failed { reason } | Outcome::Cancelled { reason } => {
                json!({"reason": reason})
            }
        }
    }
}

/// The locks one action must hold: cluster lock first, then node locks in
/// ascending UUID order. Canonical ordering is the deadlock prevention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPlan {
    pub cluster: Option<Uuid>,
    pub nodes: Vec<Uuid>,
}

impl LockPlan {
    fn targets(&self) -> Vec<Uuid> {
        let mut out = Vec::with_capacity(self.nodes.len() + 1);
        if let Some(c) = self.cluster {
            out.push(c);
        }
        out.extend(self.nodes.iter().copied());
        out
    }
}

/// Compute the lock set for an action. `node_cluster` is the target node's
/// current cluster for node-scoped kinds (resolved by the caller).
///
/// Node actions derived from a cluster action skip the cluster lock: their
/// parent already holds it and is waiting on them.
pub fn lock_plan(action: &Action, node_cluster: Option<Uuid>) -> LockPlan {
    if action.kind.is_cluster_kind() {
        let mut nodes = match &action.inputs {
            ActionInputs::ClusterAddNodes { nodes } | ActionInputs::ClusterDelNodes { nodes } => {
                nodes.clone()
            }
            _ => vec![],
        };
        nodes.sort();
        nodes.dedup();
        return LockPlan {
            cluster: Some(action.target),
            nodes,
        };
    }

    let cluster = if action.cause == ActionCause::Derived {
        None
    } else {
        match &action.inputs {
            ActionInputs::NodeJoin { cluster_id } => Some(*cluster_id),
            _ => node_cluster,
        }
    };
    LockPlan {
        cluster,
        nodes: vec![action.target],
    }
}

/// All-or-nothing acquisition in canonical order. On any failure the partial
/// set is released before returning.
async fn acquire_locks(runner: &Runner<'_>, action: &Action, plan: &LockPlan) -> Result<bool> {
    let pool = &runner.ctx.pool;
    let mut held: Vec<Uuid> = vec![];
    for target in plan.targets() {
        match db::locks::acquire(pool, target, action.id, runner.engine_id, true).await {
            Ok(true) => held.push(target),
            Ok(false) => {
                for t in held {
                    db::locks::release(pool, t, action.id).await?;
                }
                return Ok(false);
            }
            Err(e) => {
                for t in held {
                    db::locks::release(pool, t, action.id).await?;
                }
                return Err(e);
            }
        }
    }
    Ok(true)
}

async fn release_locks(runner: &Runner<'_>, action: &Action, plan: &LockPlan) {
    for target in plan.targets() {
        if let Err(e) = db::locks::release(&runner.ctx.pool, target, action.id).await {
            tracing::error!(action = %action.id, target = %target, error = %e, "failed to release lock");
        }
    }
}

/// Full lifecycle of one claimed action. The action is already RUNNING and
/// owned by this engine.
pub async fn process(runner: &Runner<'_>, mut action: Action) -> Result<()> {
    let pool = &runner.ctx.pool;
    let action_id = action.id;
    let action_name = action.name.clone();

    let node_cluster = if action.kind.is_cluster_kind() {
        None
    } else {
        db::nodes::get(pool, action.target, true)
            .await?
            .and_then(|n| n.cluster_id)
    };

    let plan = lock_plan(&action, node_cluster);
    if !acquire_locks(runner, &action, &plan).await? {
        // Contention is not failure; hand the action back and let the queue
        // retry once the current holder finishes.
        metrics::counter!("engine_actions_requeued_total").increment(1);
        tracing::debug!(action = %action_id, "lock busy, requeueing");
        db::actions::requeue(pool, action_id).await?;
        wait::sleep_cancellable(runner.cancel, Duration::from_millis(200)).await.ok();
        return Ok(());
    }

    let deadline = Duration::from_secs(action.timeout.max(1) as u64);
    let grace = runner.ctx.defaults.cancel_grace;

    let outcome: Result<Outcome> = {
        let fut = drive(runner, &mut action);
        tokio::pin!(fut);
        tokio::select! {
            out = &mut fut => out,
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(action = %action_id, "deadline exceeded, requesting cooperative cancel");
                if let Err(e) = db::actions::set_signal(pool, action_id, ActionSignal::Cancel).await {
                    tracing::warn!(action = %action_id, error = %e, "failed to signal timeout cancel");
                }
                match tokio::time::timeout(grace, &mut fut).await {
                    Ok(out) => out,
                    Err(_) => Ok(Outcome::failed("action timed out")),
                }
            }
        }
    };

    release_locks(runner, &action, &plan).await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            // Engine-side trouble (shutdown, store outage), not an action
            // verdict; give it back for another engine to retry.
            tracing::warn!(action = %action_id, error = %e, "action interrupted, requeueing");
            db::actions::requeue(pool, action_id).await?;
            return Ok(());
        }
    };

    let status = outcome.status();
    db::actions::mark(
        pool,
        action_id,
        runner.engine_id,
        status,
        outcome.reason(),
        &outcome.outputs(),
    )
    .await?;
    db::events::record(
        pool,
        if status == ActionStatus::Succeeded {
            EventLevel::Info
        } else {
            EventLevel::Error
        },
        action_id,
        "ACTION",
        &action_name,
        Some(action.kind.as_str()),
        status.as_str(),
        outcome.reason(),
        "",
        "",
    )
    .await?;

    match status {
        ActionStatus::Succeeded => {
            metrics::counter!("engine_actions_succeeded_total").increment(1);
            let woken = db::actions::resolve_dependencies(pool, action_id).await?;
            if !woken.is_empty() {
                runner.ctx.notify_dispatcher();
            }
        }
        _ => {
            metrics::counter!("engine_actions_failed_total").increment(1);
            db::actions::cancel_dependents(pool, action_id).await?;
        }
    }
    Ok(())
}

/// Pre-hooks, body, post-hooks, with the planner step and cooperative
/// cancellation checkpoints in between.
async fn drive(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let pool = &runner.ctx.pool;

    db::events::record(
        pool,
        EventLevel::Info,
        action.id,
        "ACTION",
        &action.name,
        Some(action.kind.as_str()),
        ActionStatus::Running.as_str(),
        "action started",
        "",
        "",
    )
    .await?;

    if let Err(e) = preplan(runner, action).await {
        return Ok(Outcome::failed(e.to_string()));
    }

    if check_cancelled(runner, action).await? {
        return Ok(Outcome::cancelled("cancelled before execution"));
    }

    let hook_cluster = hook_cluster_id(runner, action).await?;

    if let Some(cluster_id) = hook_cluster {
        run_hooks(runner, cluster_id, action, HookPhase::Before).await?;
        if action.data.check_failed() {
            let reason = action
                .data
                .reason
                .clone()
                .unwrap_or_else(|| "policy check failed".to_string());
            return Ok(Outcome::failed(reason));
        }
    }

    if check_cancelled(runner, action).await? {
        return Ok(Outcome::cancelled("cancelled before execution"));
    }

    let outcome = execute_body(runner, action).await?;

    if let (Outcome::Succeeded { .. }, Some(cluster_id)) = (&outcome, hook_cluster) {
        // Post-hook trouble degrades the cluster but never reverts the body.
        action.data.status = None;
        action.data.reason = None;
        run_hooks(runner, cluster_id, action, HookPhase::After).await?;
        if action.data.check_failed() {
            let reason = action
                .data
                .reason
                .clone()
                .unwrap_or_else(|| "policy check failed".to_string());
            db::clusters::update_status(pool, cluster_id, ClusterStatus::Warning, &reason).await?;
            db::events::record(
                pool,
                EventLevel::Warning,
                cluster_id,
                "CLUSTER",
                "",
                Some(action.kind.as_str()),
                ClusterStatus::Warning.as_str(),
                &reason,
                "",
                "",
            )
            .await?;
        }
    }

    Ok(outcome)
}

/// Deletion-flavored actions choose their victims before any hook runs, so
/// pre-hooks and the body act on the same set. Resize additionally resolves
/// its arithmetic here, surfacing bound violations as action failure.
async fn preplan(runner: &Runner<'_>, action: &mut Action) -> Result<()> {
    let pool = &runner.ctx.pool;
    match action.inputs.clone() {
        ActionInputs::ClusterDelNodes { nodes } => {
            if action.data.deletion.is_none() {
                action.data.deletion = Some(DeletionPlan {
                    count: nodes.len() as u32,
                    candidates: Some(nodes),
                });
                db::actions::update_data(pool, action.id, &action.data).await?;
            }
        }
        ActionInputs::ClusterScaleIn { count } => {
            if action.data.deletion.as_ref().is_none_or(|d| d.candidates.is_none()) {
                let count = action
                    .data
                    .deletion
                    .as_ref()
                    .map(|d| d.count)
                    .unwrap_or_else(|| count.map(|c| c.max(0) as u32).unwrap_or(1));
                let members = db::nodes::members(pool, action.target).await?;
                let chosen = scaling::choose_candidates(&members, count as usize);
                action.data.deletion = Some(DeletionPlan {
                    count: chosen.len() as u32,
                    candidates: Some(chosen),
                });
                db::actions::update_data(pool, action.id, &action.data).await?;
            }
        }
        ActionInputs::ClusterResize {
            adj_type,
            number,
            min_size,
            max_size,
            min_step,
            strict,
        } => {
            if action.data.creation.is_none() && action.data.deletion.is_none() {
                let cluster = require_cluster(runner, action.target).await?;
                let current = db::nodes::count_by_cluster(pool, action.target).await? as i32;
                let plan = scaling::parse_resize_params(
                    &cluster, current, adj_type, number, min_size, max_size, min_step, strict,
                )?;
                action.data.creation = plan.creation;
                if let Some(mut deletion) = plan.deletion {
                    if deletion.candidates.is_none() {
                        let members = db::nodes::members(pool, action.target).await?;
                        let chosen =
                            scaling::choose_candidates(&members, deletion.count as usize);
                        deletion.candidates = Some(chosen);
                    }
                    action.data.deletion = Some(deletion);
                }
                db::actions::update_data(pool, action.id, &action.data).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// The cluster whose bindings gate this action: the target itself for
/// cluster kinds, the owning cluster for node kinds (orphans have none).
async fn hook_cluster_id(runner: &Runner<'_>, action: &Action) -> Result<Option<Uuid>> {
    if action.kind.is_cluster_kind() {
        return Ok(Some(action.target));
    }
    Ok(db::nodes::get(&runner.ctx.pool, action.target, true)
        .await?
        .and_then(|n| n.cluster_id))
}

async fn run_hooks(
    runner: &Runner<'_>,
    cluster_id: Uuid,
    action: &mut Action,
    phase: HookPhase,
) -> Result<()> {
    let pool = &runner.ctx.pool;
    let bindings =
        policies::order_bindings(db::policies::bindings_for_cluster(pool, cluster_id).await?);

    for binding in bindings {
        if !binding.enabled {
            continue;
        }
        let Some(policy) = db::policies::get(pool, binding.policy_id, false).await? else {
            continue;
        };
        let plugin = match runner.ctx.env.new_policy(&policy) {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::error!(policy = %policy.id, error = %e, "failed to instantiate policy");
                continue;
            }
        };
        if !policies::handles(&plugin.targets(), phase, action.kind) {
            continue;
        }

        tracing::debug!(
            policy = %policy.name,
            phase = %phase,
            action = %action.id,
            "running policy hook"
        );
        let result = match phase {
            HookPhase::Before => plugin.pre_op(runner.ctx, cluster_id, action).await,
            HookPhase::After => plugin.post_op(runner.ctx, cluster_id, action).await,
        };
        if let Err(e) = result {
            action.data.status = Some(crate::models::CheckStatus::Error);
            action.data.reason = Some(e.to_string());
        }
        db::actions::update_data(pool, action.id, &action.data).await?;
        if action.data.check_failed() {
            break;
        }
    }
    Ok(())
}

async fn execute_body(runner: &Runner<'_>, action: &mut Action) -> Result<Outcome> {
    let outcome = match action.kind {
        ActionKind::ClusterCreate => cluster::do_create(runner, action).await,
        ActionKind::ClusterUpdate => cluster::do_update(runner, action).await,
        ActionKind::ClusterDelete => cluster::do_delete(runner, action).await,
        ActionKind::ClusterAddNodes => cluster::do_add_nodes(runner, action).await,
        ActionKind::ClusterDelNodes => cluster::do_del_nodes(runner, action).await,
        ActionKind::ClusterResize => cluster::do_resize(runner, action).await,
        ActionKind::ClusterScaleIn => cluster::do_scale_in(runner, action).await,
        ActionKind::ClusterScaleOut => cluster::do_scale_out(runner, action).await,
        ActionKind::ClusterAttachPolicy => cluster::do_attach_policy(runner, action).await,
        ActionKind::ClusterDetachPolicy => cluster::do_detach_policy(runner, action).await,
        ActionKind::ClusterUpdatePolicy => cluster::do_update_policy(runner, action).await,
        ActionKind::NodeCreate => node::do_create(runner, action).await,
        ActionKind::NodeUpdate => node::do_update(runner, action).await,
        ActionKind::NodeDelete => node::do_delete(runner, action).await,
        ActionKind::NodeJoin => node::do_join(runner, action).await,
        ActionKind::NodeLeave => node::do_leave(runner, action).await,
    };
    match outcome {
        Ok(outcome) => Ok(outcome),
        Err(drover_common::Error::Internal(e)) => {
            // Driver/store trouble gets bounded retries (the claim loop is
            // the backoff), then surfaces as failure. Shutdown is never a
            // verdict on the action.
            if runner.cancel.is_cancelled() || action.attempts < RETRY_LIMIT {
                Err(drover_common::Error::Internal(e))
            } else {
                Ok(Outcome::failed(format!(
                    "failed after {} attempts: {e}",
                    action.attempts
                )))
            }
        }
        // Client-visible error kinds are action verdicts, not engine trouble.
        Err(e) => Ok(Outcome::failed(e.to_string())),
    }
}

/// Executions granted to an action before a persistent internal error is
/// treated as its own failure.
const RETRY_LIMIT: i32 = 3;

/// True when a cancel signal has been written to the action row or the
/// engine itself is shutting down.
pub(crate) async fn check_cancelled(runner: &Runner<'_>, action: &Action) -> Result<bool> {
    if runner.cancel.is_cancelled() {
        return Err(drover_common::Error::Internal(anyhow::anyhow!(
            "engine shutting down"
        )));
    }
    let signal = db::actions::read_signal(&runner.ctx.pool, action.id).await?;
    Ok(signal == Some(ActionSignal::Cancel))
}

pub(crate) async fn require_cluster(runner: &Runner<'_>, id: Uuid) -> Result<Cluster> {
    db::clusters::get(&runner.ctx.pool, id, false)
        .await?
        .ok_or(drover_common::Error::NotFound {
            kind: "cluster",
            id: id.to_string(),
        })
}

/// Insert a derived child action in READY state and wake a worker for it.
pub(crate) async fn spawn_child(
    runner: &Runner<'_>,
    prefix: &str,
    target: Uuid,
    inputs: ActionInputs,
    timeout: i64,
) -> Result<Uuid> {
    let now = now_ms();
    let id = Uuid::new_v4();
    let child = Action {
        id,
        name: format!("{prefix}_{}", short_id(&id)),
        target,
        kind: inputs.kind(),
        cause: ActionCause::Derived,
        owner: None,
        start_time: None,
        end_time: None,
        timeout,
        status: ActionStatus::Ready,
        status_reason: String::new(),
        signal: None,
        inputs,
        outputs: json!({}),
        data: Default::default(),
        attempts: 0,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    db::actions::insert(&runner.ctx.pool, &child, &[]).await?;
    runner.ctx.notify_dispatcher();
    Ok(id)
}

pub(crate) enum ChildWait {
    AllSucceeded,
    SomeFailed(Vec<Uuid>),
    Cancelled,
}

/// Poll child actions to completion. Cancelling the parent cascades: pending
/// children are cancelled outright, running ones get the cooperative signal.
pub(crate) async fn wait_for_children(
    runner: &Runner<'_>,
    parent: &Action,
    children: &[Uuid],
) -> Result<ChildWait> {
    if children.is_empty() {
        return Ok(ChildWait::AllSucceeded);
    }
    let pool = &runner.ctx.pool;
    loop {
        let states = db::actions::get_many(pool, children).await?;
        if states.iter().all(|a| a.status.is_terminal()) {
            let failed: Vec<Uuid> = states
                .iter()
                .filter(|a| a.status != ActionStatus::Succeeded)
                .map(|a| a.id)
                .collect();
            return Ok(if failed.is_empty() {
                ChildWait::AllSucceeded
            } else {
                ChildWait::SomeFailed(failed)
            });
        }

        if check_cancelled(runner, parent).await? {
            for child in &states {
                if child.status.is_terminal() {
                    continue;
                }
                if !db::actions::cancel_if_pending(pool, child.id).await?
                    && child.status == ActionStatus::Running
                {
                    db::actions::set_signal(pool, child.id, ActionSignal::Cancel).await?;
                }
            }
            return Ok(ChildWait::Cancelled);
        }

        wait::sleep_cancellable(runner.cancel, Duration::from_millis(500))
            .await
            .map_err(drover_common::Error::Internal)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionData;

    fn action(inputs: ActionInputs, cause: ActionCause, target: Uuid) -> Action {
        let kind = inputs.kind();
        Action {
            id: Uuid::new_v4(),
            name: "t".into(),
            target,
            kind,
            cause,
            owner: None,
            start_time: None,
            end_time: None,
            timeout: 3600,
            status: ActionStatus::Running,
            status_reason: String::new(),
            signal: None,
            inputs,
            outputs: json!({}),
            data: ActionData::default(),
            attempts: 1,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn cluster_actions_lock_their_target_first() {
        let target = Uuid::new_v4();
        let plan = lock_plan(&action(ActionInputs::ClusterCreate, ActionCause::Rpc, target), None);
        assert_eq!(plan.cluster, Some(target));
        assert!(plan.nodes.is_empty());
        assert_eq!(plan.targets(), vec![target]);
    }

    #[test]
    fn membership_actions_add_node_locks_sorted() {
        let target = Uuid::new_v4();
        let mut nodes = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let plan = lock_plan(
            &action(
                ActionInputs::ClusterAddNodes { nodes: nodes.clone() },
                ActionCause::Rpc,
                target,
            ),
            None,
        );
        nodes.sort();
        assert_eq!(plan.cluster, Some(target));
        assert_eq!(plan.nodes, nodes);
        // canonical order: cluster first, then nodes ascending
        assert_eq!(plan.targets()[0], target);
    }

    #[test]
    fn rpc_node_actions_take_the_owning_cluster_lock() {
        let node_id = Uuid::new_v4();
        let cluster_id = Uuid::new_v4();
        let plan = lock_plan(
            &action(ActionInputs::NodeDelete, ActionCause::Rpc, node_id),
            Some(cluster_id),
        );
        assert_eq!(plan.cluster, Some(cluster_id));
        assert_eq!(plan.nodes, vec![node_id]);
    }

    #[test]
    fn derived_node_actions_skip_the_cluster_lock() {
        let node_id = Uuid::new_v4();
        let plan = lock_plan(
            &action(ActionInputs::NodeCreate, ActionCause::Derived, node_id),
            Some(Uuid::new_v4()),
        );
        assert_eq!(plan.cluster, None);
        assert_eq!(plan.nodes, vec![node_id]);
    }

    #[test]
    fn node_join_locks_the_destination_cluster() {
        let node_id = Uuid::new_v4();
        let destination = Uuid::new_v4();
        let plan = lock_plan(
            &action(
                ActionInputs::NodeJoin { cluster_id: destination },
                ActionCause::Rpc,
                node_id,
            ),
            None,
        );
        assert_eq!(plan.cluster, Some(destination));
    }

    #[test]
    fn orphan_node_actions_need_no_cluster_lock() {
        let node_id = Uuid::new_v4();
        let plan = lock_plan(&action(ActionInputs::NodeLeave, ActionCause::Rpc, node_id), None);
        assert_eq!(plan.cluster, None);
        assert_eq!(plan.nodes, vec![node_id]);
    }

    #[test]
    fn failure_outcomes_carry_the_reason_in_outputs() {
        let out = Outcome::failed("boom");
        assert_eq!(out.status(), ActionStatus::Failed);
        assert_eq!(out.outputs(), json!({"reason": "boom"}));

        let ok = Outcome::ok_with("done", json!({"nodes": []}));
        assert_eq!(ok.status(), ActionStatus::Succeeded);
        assert_eq!(ok.outputs(), json!({"nodes": []}));
    }
}
