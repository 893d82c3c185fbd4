use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{ActionKind, Webhook, WebhookObjType};

use super::ListParams;

const COLS: &str = r#"id, name, obj_id, obj_type, action, key_hash, params, "user", project,
    domain, created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Result<Webhook> {
    Ok(Webhook {
        id: row.get("id"),
        name: row.get("name"),
        obj_id: row.get("obj_id"),
        obj_type: WebhookObjType::parse(row.get("obj_type"))?,
        action: ActionKind::parse(row.get("action"))?,
        key_hash: row.get("key_hash"),
        params: row.get("params"),
        user: row.get("user"),
        project: row.get("project"),
        domain: row.get("domain"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub async fn insert(pool: &Pool, webhook: &Webhook) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                "INSERT INTO webhook ({COLS})
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)"
            ),
            &[
                &webhook.id,
                &webhook.name,
                &webhook.obj_id,
                &webhook.obj_type.as_str(),
                &webhook.action.as_str(),
                &webhook.key_hash,
                &webhook.params,
                &webhook.user,
                &webhook.project,
                &webhook.domain,
                &webhook.created_at,
                &webhook.updated_at,
                &webhook.deleted_at,
            ],
        )
        .await
        .context("failed to insert webhook")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Webhook>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM webhook WHERE id = $1 {filter}"),
            &[&id],
        )
        .await
        .context("failed to get webhook")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(
    pool: &Pool,
    project: Option<&str>,
    name: &str,
) -> Result<Option<Webhook>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM webhook
                         WHERE name = $1 AND project = $2 AND deleted_at IS NULL"
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!("SELECT {COLS} FROM webhook WHERE name = $1 AND deleted_at IS NULL"),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get webhook by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple webhooks named '{name}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Webhook>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM webhook
                         WHERE id::text LIKE $1 AND project = $2 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM webhook
                         WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get webhook by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple webhooks match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Webhook>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM webhook WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if params.project.is_some() {
        sql.push_str(" AND project = $1");
    }
    sql.push_str(" ORDER BY created_at");
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
    .context("failed to list webhooks")?;
    rows.iter().map(from_row).collect()
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE webhook SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete webhook")?;
    Ok(())
}
