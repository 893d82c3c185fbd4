//! The per-engine worker pool. Workers pull claimable actions from the
//! store, execute them under locks, and sleep with jittered backoff when the
//! queue is dry (the in-process wake channel cuts the latency for work
//! submitted to this engine). A heartbeat task publishes liveness and steals
//! work abandoned by dead engines.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_common::{Result, now_ms, wait};

use crate::actions::{self, Runner};
use crate::context::EngineContext;
use crate::db;
use crate::models::EventLevel;

pub struct DispatcherHandle {
    pub engine_id: Uuid,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Wait for all workers to drain after the cancel token fired.
    pub async fn join(self) {
        futures::future::join_all(self.tasks).await;
    }
}

/// Register the engine, run a recovery pass, and spawn the worker pool plus
/// the heartbeat task.
pub async fn start(
    ctx: EngineContext,
    workers: usize,
    cancel: CancellationToken,
) -> Result<DispatcherHandle> {
    let engine_id = Uuid::new_v4();
    let heartbeat = ctx.defaults.heartbeat_interval;

    db::health::engine_register(&ctx.pool, engine_id, heartbeat.as_millis() as i64).await?;
    recover_abandoned(&ctx, engine_id).await?;

    tracing::info!(engine = %engine_id, workers, "starting dispatcher");

    let mut tasks = Vec::with_capacity(workers + 1);
    for worker in 0..workers {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            worker_loop(ctx, engine_id, worker, cancel).await;
        }));
    }
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            heartbeat_loop(ctx, engine_id, cancel).await;
        }));
    }

    Ok(DispatcherHandle { engine_id, tasks })
}

async fn worker_loop(ctx: EngineContext, engine_id: Uuid, worker: usize, cancel: CancellationToken) {
    let cap = ctx.defaults.claim_backoff_cap;
    let mut idle_rounds = 0usize;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match db::actions::claim(&ctx.pool, engine_id).await {
            Ok(Some(action)) => {
                idle_rounds = 0;
                metrics::counter!("engine_actions_claimed_total").increment(1);
                metrics::gauge!("engine_workers_busy").increment(1.0);
                tracing::info!(
                    worker,
                    action = %action.id,
                    kind = %action.kind,
                    target = %action.target,
                    "claimed action"
                );
                let runner = Runner {
                    ctx: &ctx,
                    engine_id,
                    cancel: &cancel,
                };
                if let Err(e) = actions::process(&runner, action).await {
                    tracing::error!(worker, error = ?e, "action processing failed");
                }
                metrics::gauge!("engine_workers_busy").decrement(1.0);
            }
            Ok(None) => {
                idle_rounds += 1;
                if wait::idle_wait(&cancel, &ctx.wake, idle_rounds, cap).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(worker, error = ?e, "claim query failed");
                idle_rounds += 1;
                if wait::idle_wait(&cancel, &ctx.wake, idle_rounds, cap).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker, "worker stopped");
}

async fn heartbeat_loop(ctx: EngineContext, engine_id: Uuid, cancel: CancellationToken) {
    let interval = ctx.defaults.heartbeat_interval;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = db::health::engine_heartbeat(&ctx.pool, engine_id).await {
            tracing::warn!(error = %e, "heartbeat failed");
            continue;
        }
        if let Err(e) = recover_abandoned(&ctx, engine_id).await {
            tracing::warn!(error = %e, "recovery pass failed");
        }
    }
    // Best effort; a dead row ages out via the heartbeat cutoff anyway.
    let _ = db::health::remove_engines(&ctx.pool, &[engine_id]).await;
}

/// Steal work from engines whose heartbeat went stale: requeue their RUNNING
/// actions and break their locks. Safe to run from every engine; claims are
/// still serialized by the store.
async fn recover_abandoned(ctx: &EngineContext, engine_id: Uuid) -> Result<()> {
    let heartbeat = ctx.defaults.heartbeat_interval.as_millis() as i64;
    let cutoff = now_ms() - 2 * heartbeat;
    let stale = db::health::stale_engines(&ctx.pool, engine_id, cutoff).await?;
    if stale.is_empty() {
        return Ok(());
    }

    tracing::warn!(engines = ?stale, "recovering work from stale engines");
    let abandoned = db::actions::running_owned_by(&ctx.pool, &stale).await?;
    for action in &abandoned {
        db::actions::requeue(&ctx.pool, action.id).await?;
        db::events::record(
            &ctx.pool,
            EventLevel::Warning,
            action.id,
            "ACTION",
            &action.name,
            Some(action.kind.as_str()),
            "READY",
            "requeued after engine failure",
            "",
            "",
        )
        .await?;
    }
    let broken = db::locks::break_engine_locks(&ctx.pool, &stale).await?;
    db::health::remove_engines(&ctx.pool, &stale).await?;
    metrics::counter!("engine_recoveries_total").increment(1);
    tracing::info!(
        actions = abandoned.len(),
        locks = broken,
        "recovery pass complete"
    );
    if !abandoned.is_empty() {
        ctx.notify_dispatcher();
    }
    Ok(())
}
