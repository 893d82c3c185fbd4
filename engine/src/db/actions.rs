//! Action repository. `claim` and the terminal transitions are the
//! serialization points of the whole pipeline: claiming is a single
//! `FOR UPDATE SKIP LOCKED` CAS so concurrent engines never pick the same
//! action, and `mark` refuses writers that no longer own the row.

use anyhow::{Context, anyhow};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{Action, ActionCause, ActionData, ActionKind, ActionSignal, ActionStatus};

use super::ListParams;

const COLS: &str = "id, name, target, kind, cause, owner, start_time, end_time, timeout,
    status, status_reason, signal, inputs, outputs, data, attempts,
    created_at, updated_at, deleted_at";

fn from_row(row: &Row) -> Result<Action> {
    let inputs: serde_json::Value = row.get("inputs");
    let data: serde_json::Value = row.get("data");
    let signal: Option<String> = row.get("signal");
    Ok(Action {
        id: row.get("id"),
        name: row.get("name"),
        target: row.get("target"),
        kind: ActionKind::parse(row.get("kind"))?,
        cause: ActionCause::parse(row.get("cause"))?,
        owner: row.get("owner"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        timeout: row.get("timeout"),
        status: ActionStatus::parse(row.get("status"))?,
        status_reason: row.get("status_reason"),
        signal: signal.as_deref().map(ActionSignal::parse).transpose()?,
        inputs: serde_json::from_value(inputs)
            .map_err(|e| Error::Internal(anyhow!("corrupt action inputs: {e}")))?,
        outputs: row.get("outputs"),
        data: serde_json::from_value(data)
            .map_err(|e| Error::Internal(anyhow!("corrupt action data: {e}")))?,
        attempts: row.get("attempts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub async fn insert(pool: &Pool, action: &Action, depends_on: &[Uuid]) -> Result<()> {
    let mut client = pool.get().await?;
    let tx = client
        .transaction()
        .await
        .context("failed to open transaction")?;
    tx.execute(
        &format!(
            "INSERT INTO action ({COLS})
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)"
        ),
        &[
            &action.id,
            &action.name,
            &action.target,
            &action.kind.as_str(),
            &action.cause.as_str(),
            &action.owner,
            &action.start_time,
            &action.end_time,
            &action.timeout,
            &action.status.as_str(),
            &action.status_reason,
            &action.signal.map(|s| s.as_str()),
            &serde_json::to_value(&action.inputs).map_err(anyhow::Error::new)?,
            &action.outputs,
            &serde_json::to_value(&action.data).map_err(anyhow::Error::new)?,
            &action.attempts,
            &action.created_at,
            &action.updated_at,
            &action.deleted_at,
        ],
    )
    .await
    .context("failed to insert action")?;
    for dep in depends_on {
        tx.execute(
            "INSERT INTO action_dependency (action_id, depends_on) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
            &[&action.id, dep],
        )
        .await
        .context("failed to insert action dependency")?;
    }
    tx.commit().await.context("failed to commit action insert")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<Option<Action>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM action WHERE id = $1 AND deleted_at IS NULL"),
            &[&id],
        )
        .await
        .context("failed to get action")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(pool: &Pool, name: &str) -> Result<Option<Action>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!("SELECT {COLS} FROM action WHERE name = $1 AND deleted_at IS NULL LIMIT 2"),
            &[&name],
        )
        .await
        .context("failed to get action by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!("multiple actions named '{name}'")));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(pool: &Pool, prefix: &str) -> Result<Option<Action>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = client
        .query(
            &format!(
                "SELECT {COLS} FROM action
                 WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
            ),
            &[&pattern],
        )
        .await
        .context("failed to get action by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple actions match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_many(pool: &Pool, ids: &[Uuid]) -> Result<Vec<Action>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!("SELECT {COLS} FROM action WHERE id = ANY($1)"),
            &[&ids],
        )
        .await
        .context("failed to get actions")?;
    rows.iter().map(from_row).collect()
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Action>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM action WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(marker) = params.marker {
        sql.push_str(&format!(
            " AND created_at > (SELECT created_at FROM action WHERE id = '{}')",
            marker
        ));
    }
    sql.push(' ');
    sql.push_str(&params.order_clause());
    if let Some(limit) = params.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let rows = client.query(&sql, &[]).await.context("failed to list actions")?;
    rows.iter().map(from_row).collect()
}

/// Atomically pick one READY action with all dependencies satisfied, flip it
/// to RUNNING and assign it to `engine_id`. Serializable across engines:
/// `FOR UPDATE SKIP LOCKED` guarantees two concurrent claims never return
/// the same row.
pub async fn claim(pool: &Pool, engine_id: Uuid) -> Result<Option<Action>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!(
                r#"WITH ready AS (
                       SELECT id AS ready_id FROM action a
                       WHERE a.status = 'READY' AND a.deleted_at IS NULL
                         AND NOT EXISTS (
                             SELECT 1 FROM action_dependency d
                             JOIN action dep ON dep.id = d.depends_on
                             WHERE d.action_id = a.id AND dep.status <> 'SUCCEEDED')
                       ORDER BY a.created_at
                       LIMIT 1
                       FOR UPDATE SKIP LOCKED
                   )
                   UPDATE action a
                   SET status = 'RUNNING', owner = $1, start_time = $2, updated_at = $2,
                       attempts = a.attempts + 1
                   FROM ready WHERE a.id = ready.ready_id
                   RETURNING {COLS}"#
            ),
            &[&engine_id, &now_ms()],
        )
        .await
        .context("failed to claim action")?;
    row.as_ref().map(from_row).transpose()
}

/// Terminal transition, refused unless `engine_id` still owns the action.
pub async fn mark(
    pool: &Pool,
    id: Uuid,
    engine_id: Uuid,
    status: ActionStatus,
    reason: &str,
    outputs: &serde_json::Value,
) -> Result<()> {
    let client = pool.get().await?;
    let n = client
        .execute(
            r#"UPDATE action
               SET status = $3, status_reason = $4, outputs = $5, end_time = $6,
                   updated_at = $6, owner = NULL, signal = NULL
               WHERE id = $1 AND owner = $2 AND status = 'RUNNING'"#,
            &[&id, &engine_id, &status.as_str(), &reason, &outputs, &now_ms()],
        )
        .await
        .context("failed to mark action")?;
    if n == 0 {
        return Err(Error::Internal(anyhow!(
            "action {id} is no longer owned by engine {engine_id}"
        )));
    }
    Ok(())
}

/// Hand a claimed action back to the queue (lock contention, engine
/// recovery). The attempt already counted stays counted.
pub async fn requeue(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE action
               SET status = 'READY', owner = NULL, start_time = NULL, updated_at = $2
               WHERE id = $1 AND status = 'RUNNING'"#,
            &[&id, &now_ms()],
        )
        .await
        .context("failed to requeue action")?;
    Ok(())
}

/// Persist the shared planner/hook scratch space mid-flight.
pub async fn update_data(pool: &Pool, id: Uuid, data: &ActionData) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE action SET data = $2, updated_at = $3 WHERE id = $1",
            &[
                &id,
                &serde_json::to_value(data).map_err(anyhow::Error::new)?,
                &now_ms(),
            ],
        )
        .await
        .context("failed to update action data")?;
    Ok(())
}

/// Cancel an action that has not started running. Returns false when the
/// action was already past the point of no return.
pub async fn cancel_if_pending(pool: &Pool, id: Uuid) -> Result<bool> {
    let client = pool.get().await?;
    let n = client
        .execute(
            r#"UPDATE action
               SET status = 'CANCELLED', status_reason = 'cancelled', end_time = $2, updated_at = $2
               WHERE id = $1 AND status IN ('INIT', 'WAITING', 'READY')"#,
            &[&id, &now_ms()],
        )
        .await
        .context("failed to cancel action")?;
    Ok(n > 0)
}

pub async fn set_signal(pool: &Pool, id: Uuid, signal: ActionSignal) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE action SET signal = $2, updated_at = $3 WHERE id = $1",
            &[&id, &signal.as_str(), &now_ms()],
        )
        .await
        .context("failed to signal action")?;
    Ok(())
}

pub async fn read_signal(pool: &Pool, id: Uuid) -> Result<Option<ActionSignal>> {
    let client = pool.get().await?;
    let row = client
        .query_opt("SELECT signal FROM action WHERE id = $1", &[&id])
        .await
        .context("failed to read action signal")?;
    let signal: Option<String> = match row {
        Some(r) => r.get("signal"),
        None => None,
    };
    signal.as_deref().map(ActionSignal::parse).transpose()
}

/// After `action_id` succeeded: flip every WAITING dependent whose remaining
/// dependencies are all SUCCEEDED to READY. Returns the woken action ids.
pub async fn resolve_dependencies(pool: &Pool, action_id: Uuid) -> Result<Vec<Uuid>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"UPDATE action
               SET status = 'READY', updated_at = $2
               WHERE status = 'WAITING' AND deleted_at IS NULL
                 AND id IN (SELECT action_id FROM action_dependency WHERE depends_on = $1)
                 AND NOT EXISTS (
                     SELECT 1 FROM action_dependency d
                     JOIN action dep ON dep.id = d.depends_on
                     WHERE d.action_id = action.id AND dep.status <> 'SUCCEEDED')
               RETURNING id"#,
            &[&action_id, &now_ms()],
        )
        .await
        .context("failed to resolve dependencies")?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// After `action_id` failed or was cancelled: pending dependents can never
/// run, cancel them.
pub async fn cancel_dependents(pool: &Pool, action_id: Uuid) -> Result<Vec<Uuid>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            r#"UPDATE action
               SET status = 'CANCELLED', status_reason = 'dependency failed',
                   end_time = $2, updated_at = $2
               WHERE status IN ('INIT', 'WAITING', 'READY') AND deleted_at IS NULL
                 AND id IN (SELECT action_id FROM action_dependency WHERE depends_on = $1)
               RETURNING id"#,
            &[&action_id, &now_ms()],
        )
        .await
        .context("failed to cancel dependents")?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// RUNNING actions owned by engines presumed dead; recovery requeues them.
pub async fn running_owned_by(pool: &Pool, engine_ids: &[Uuid]) -> Result<Vec<Action>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!(
                "SELECT {COLS} FROM action
                 WHERE status = 'RUNNING' AND owner = ANY($1) AND deleted_at IS NULL"
            ),
            &[&engine_ids],
        )
        .await
        .context("failed to list abandoned actions")?;
    rows.iter().map(from_row).collect()
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE action SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete action")?;
    Ok(())
}
