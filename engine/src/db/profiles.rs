use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::Profile;

use super::ListParams;

const COLS: &str = r#"id, name, type_name, spec, permission, metadata, "user", project, domain,
    created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Result<Profile> {
    Ok(Profile {
        id: row.get("id"),
        name: row.get("name"),
        type_name: row.get("type_name"),
        spec: row.get("spec"),
        permission: row.get("permission"),
        metadata: row.get("metadata"),
        user: row.get("user"),
        project: row.get("project"),
        domain: row.get("domain"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub async fn insert(pool: &Pool, profile: &Profile) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                "INSERT INTO profile ({COLS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"
            ),
            &[
                &profile.id,
                &profile.name,
                &profile.type_name,
                &profile.spec,
                &profile.permission,
                &profile.metadata,
                &profile.user,
                &profile.project,
                &profile.domain,
                &profile.created_at,
                &profile.updated_at,
                &profile.deleted_at,
            ],
        )
        .await
        .context("failed to insert profile")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Profile>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM profile WHERE id = $1 {filter}"),
            &[&id],
        )
        .await
        .context("failed to get profile")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(
    pool: &Pool,
    project: Option<&str>,
    name: &str,
) -> Result<Option<Profile>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM profile
                         WHERE name = $1 AND project = $2 AND deleted_at IS NULL"
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!("SELECT {COLS} FROM profile WHERE name = $1 AND deleted_at IS NULL"),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get profile by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple profiles named '{name}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Profile>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM profile
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
                        "SELECT {COLS} FROM profile
                         WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get profile by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple profiles match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Profile>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM profile WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if params.project.is_some() {
        sql.push_str(" AND project = $1");
    }
    sql.push(' ');
    sql.push_str(&params.order_clause());
    if let Some(limit) = params.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let rows = match params.project.as_deref() {
        Some(p) => client.query(&sql, &[&p]).await,
        None => client.query(&sql, &[]).await,
    }
    .context("failed to list profiles")?;
    rows.iter().map(from_row).collect()
}

/// In-place update of the mutable fields. Spec changes are not updates; they
/// produce a new profile row at the façade.
pub async fn update_properties(
    pool: &Pool,
    id: Uuid,
    name: &str,
    permission: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE profile SET name = $2, permission = $3, metadata = $4, updated_at = $5 WHERE id = $1",
            &[&id, &name, &permission, &metadata, &now_ms()],
        )
        .await
        .context("failed to update profile")?;
    Ok(())
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE profile SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete profile")?;
    Ok(())
}
