use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{Cluster, ClusterStatus};

use super::ListParams;

const COLS: &str = r#"id, name, profile_id, parent, desired_capacity, min_size, max_size,
    timeout, status, status_reason, metadata, data, "user", project, domain,
    created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Result<Cluster> {
    Ok(Cluster {
        id: row.get("id"),
        name: row.get("name"),
        profile_id: row.get("profile_id"),
        parent: row.get("parent"),
        desired_capacity: row.get("desired_capacity"),
        min_size: row.get("min_size"),
        max_size: row.get("max_size"),
        timeout: row.get("timeout"),
        status: ClusterStatus::parse(row.get("status"))?,
        status_reason: row.get("status_reason"),
        metadata: row.get("metadata"),
        data: row.get("data"),
        user: row.get("user"),
        project: row.get("project"),
        domain: row.get("domain"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub async fn insert(pool: &Pool, cluster: &Cluster) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                r#"INSERT INTO cluster ({COLS})
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)"#
            ),
            &[
                &cluster.id,
                &cluster.name,
                &cluster.profile_id,
                &cluster.parent,
                &cluster.desired_capacity,
                &cluster.min_size,
                &cluster.max_size,
                &cluster.timeout,
                &cluster.status.as_str(),
                &cluster.status_reason,
                &cluster.metadata,
                &cluster.data,
                &cluster.user,
                &cluster.project,
                &cluster.domain,
                &cluster.created_at,
                &cluster.updated_at,
                &cluster.deleted_at,
            ],
        )
        .await
        .context("failed to insert cluster")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Cluster>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM cluster WHERE id = $1 {filter}"),
            &[&id],
        )
        .await
        .context("failed to get cluster")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(pool: &Pool, project: Option<&str>, name: &str) -> Result<Option<Cluster>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM cluster
                         WHERE name = $1 AND project = $2 AND deleted_at IS NULL"
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!("SELECT {COLS} FROM cluster WHERE name = $1 AND deleted_at IS NULL"),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get cluster by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple clusters named '{name}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Cluster>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM cluster
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
                        "SELECT {COLS} FROM cluster
                         WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get cluster by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple clusters match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Cluster>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM cluster WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if params.project.is_some() {
        sql.push_str(" AND project = $1");
    }
    if let Some(marker) = params.marker {
        sql.push_str(&format!(
            " AND created_at > (SELECT created_at FROM cluster WHERE id = '{}')",
            marker
        ));
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
    .context("failed to list clusters")?;
    rows.iter().map(from_row).collect()
}

pub async fn update_status(
    pool: &Pool,
    id: Uuid,
    status: ClusterStatus,
    reason: &str,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE cluster SET status = $2, status_reason = $3, updated_at = $4 WHERE id = $1",
            &[&id, &status.as_str(), &reason, &now_ms()],
        )
        .await
        .context("failed to update cluster status")?;
    Ok(())
}

/// Persist the mutable properties the façade and action bodies may change.
pub async fn update(pool: &Pool, cluster: &Cluster) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE cluster
               SET name = $2, profile_id = $3, parent = $4, desired_capacity = $5,
                   min_size = $6, max_size = $7, timeout = $8, status = $9,
                   status_reason = $10, metadata = $11, data = $12, updated_at = $13
               WHERE id = $1"#,
            &[
                &cluster.id,
                &cluster.name,
                &cluster.profile_id,
                &cluster.parent,
                &cluster.desired_capacity,
                &cluster.min_size,
                &cluster.max_size,
                &cluster.timeout,
                &cluster.status.as_str(),
                &cluster.status_reason,
                &cluster.metadata,
                &cluster.data,
                &now_ms(),
            ],
        )
        .await
        .context("failed to update cluster")?;
    Ok(())
}

pub async fn update_size(
    pool: &Pool,
    id: Uuid,
    desired: i32,
    min_size: Option<i32>,
    max_size: Option<i32>,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE cluster
               SET desired_capacity = $2,
                   min_size = COALESCE($3, min_size),
                   max_size = COALESCE($4, max_size),
                   updated_at = $5
               WHERE id = $1"#,
            &[&id, &desired, &min_size, &max_size, &now_ms()],
        )
        .await
        .context("failed to update cluster size")?;
    Ok(())
}

pub async fn update_data(pool: &Pool, id: Uuid, data: &serde_json::Value) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE cluster SET data = $2, updated_at = $3 WHERE id = $1",
            &[&id, &data, &now_ms()],
        )
        .await
        .context("failed to update cluster data")?;
    Ok(())
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE cluster SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete cluster")?;
    Ok(())
}

/// Live clusters referencing a profile; guards profile deletion.
pub async fn count_by_profile(pool: &Pool, profile_id: Uuid) -> Result<i64> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM cluster WHERE profile_id = $1 AND deleted_at IS NULL",
            &[&profile_id],
        )
        .await
        .context("failed to count clusters by profile")?;
    Ok(row.get(0))
}
