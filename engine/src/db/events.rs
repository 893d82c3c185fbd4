use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{Event, EventLevel};

use super::ListParams;

const COLS: &str = r#"id, "timestamp", level, obj_id, obj_type, obj_name, action, status,
    status_reason, "user", project, deleted_at"#;

fn from_row(row: &Row) -> Result<Event> {
    Ok(Event {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        level: EventLevel::parse(row.get("level"))?,
        obj_id: row.get("obj_id"),
        obj_type: row.get("obj_type"),
        obj_name: row.get("obj_name"),
        action: row.get("action"),
        status: row.get("status"),
        status_reason: row.get("status_reason"),
        user: row.get("user"),
        project: row.get("project"),
        deleted_at: row.get("deleted_at"),
    })
}

/// Append one state-transition record. Events are write-once; nothing
/// updates them afterwards.
#[allow(clippy::too_many_arguments)]
pub async fn record(
    pool: &Pool,
    level: EventLevel,
    obj_id: Uuid,
    obj_type: &str,
    obj_name: &str,
    action: Option<&str>,
    status: &str,
    status_reason: &str,
    user: &str,
    project: &str,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                r#"INSERT INTO event ({COLS})
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,NULL)"#
            ),
            &[
                &Uuid::new_v4(),
                &now_ms(),
                &level.as_str(),
                &obj_id,
                &obj_type,
                &obj_name,
                &action,
                &status,
                &status_reason,
                &user,
                &project,
            ],
        )
        .await
        .context("failed to record event")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid) -> Result<Option<Event>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM event WHERE id = $1 AND deleted_at IS NULL"),
            &[&id],
        )
        .await
        .context("failed to get event")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_short_id(pool: &Pool, prefix: &str) -> Result<Option<Event>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = client
        .query(
            &format!(
                "SELECT {COLS} FROM event
                 WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
            ),
            &[&pattern],
        )
        .await
        .context("failed to get event by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple events match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams, obj_id: Option<Uuid>) -> Result<Vec<Event>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM event WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(oid) = obj_id {
        sql.push_str(&format!(" AND obj_id = '{oid}'"));
    }
    if params.project.is_some() {
        sql.push_str(" AND project = $1");
    }
    sql.push_str(r#" ORDER BY "timestamp""#);
    if params.descending {
        sql.push_str(" DESC");
    }
    if let Some(limit) = params.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let rows = match params.project.as_deref() {
        Some(p) => client.query(&sql, &[&p]).await,
        None => client.query(&sql, &[]).await,
    }
    .context("failed to list events")?;
    rows.iter().map(from_row).collect()
}
