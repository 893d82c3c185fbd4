use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::Trigger;

use super::ListParams;

const COLS: &str = r#"id, name, type_name, spec, description, enabled, state, severity,
    "user", project, domain, created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Trigger {
    Trigger {
        id: row.get("id"),
        name: row.get("name"),
        type_name: row.get("type_name"),
        spec: row.get("spec"),
        description: row.get("description"),
        enabled: row.get("enabled"),
        state: row.get("state"),
        severity: row.get("severity"),
        user: row.get("user"),
        project: row.get("project"),
        domain: row.get("domain"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    }
}

pub async fn insert(pool: &Pool, trigger: &Trigger) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                r#"INSERT INTO "trigger" ({COLS})
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"#
            ),
            &[
                &trigger.id,
                &trigger.name,
                &trigger.type_name,
                &trigger.spec,
                &trigger.description,
                &trigger.enabled,
                &trigger.state,
                &trigger.severity,
                &trigger.user,
                &trigger.project,
                &trigger.domain,
                &trigger.created_at,
                &trigger.updated_at,
                &trigger.deleted_at,
            ],
        )
        .await
        .context("failed to insert trigger")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Trigger>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!(r#"SELECT {COLS} FROM "trigger" WHERE id = $1 {filter}"#),
            &[&id],
        )
        .await
        .context("failed to get trigger")?;
    Ok(row.as_ref().map(from_row))
}

pub async fn get_by_name(
    pool: &Pool,
    project: Option<&str>,
    name: &str,
) -> Result<Option<Trigger>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        r#"SELECT {COLS} FROM "trigger"
                           WHERE name = $1 AND project = $2 AND deleted_at IS NULL"#
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        r#"SELECT {COLS} FROM "trigger" WHERE name = $1 AND deleted_at IS NULL"#
                    ),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get trigger by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple triggers named '{name}'"
        )));
    }
    Ok(rows.first().map(from_row))
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Trigger>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        r#"SELECT {COLS} FROM "trigger"
                           WHERE id::text LIKE $1 AND project = $2 AND deleted_at IS NULL LIMIT 2"#
                    ),
                    &[&pattern, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!(
                        r#"SELECT {COLS} FROM "trigger"
                           WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"#
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get trigger by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple triggers match short id '{prefix}'"
        )));
    }
    Ok(rows.first().map(from_row))
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Trigger>> {
    let client = pool.get().await?;
    let mut sql = format!(r#"SELECT {COLS} FROM "trigger" WHERE TRUE"#);
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
    .context("failed to list triggers")?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE "trigger" SET deleted_at = $2, updated_at = $2
               WHERE id = $1 AND deleted_at IS NULL"#,
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete trigger")?;
    Ok(())
}
