use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{Node, NodeStatus};

use super::ListParams;

const COLS: &str = r#"id, name, profile_id, cluster_id, role, "index", status, status_reason,
    physical_id, metadata, data, "user", project, domain, created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Result<Node> {
    Ok(Node {
        id: row.get("id"),
        name: row.get("name"),
        profile_id: row.get("profile_id"),
        cluster_id: row.get("cluster_id"),
        role: row.get("role"),
        index: row.get("index"),
        status: NodeStatus::parse(row.get("status"))?,
        status_reason: row.get("status_reason"),
        physical_id: row.get("physical_id"),
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

pub async fn insert(pool: &Pool, node: &Node) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                r#"INSERT INTO node ({COLS})
                   VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)"#
            ),
            &[
                &node.id,
                &node.name,
                &node.profile_id,
                &node.cluster_id,
                &node.role,
                &node.index,
                &node.status.as_str(),
                &node.status_reason,
                &node.physical_id,
                &node.metadata,
                &node.data,
                &node.user,
                &node.project,
                &node.domain,
                &node.created_at,
                &node.updated_at,
                &node.deleted_at,
            ],
        )
        .await
        .context("failed to insert node")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Node>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM node WHERE id = $1 {filter}"),
            &[&id],
        )
        .await
        .context("failed to get node")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(pool: &Pool, project: Option<&str>, name: &str) -> Result<Option<Node>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM node
                         WHERE name = $1 AND project = $2 AND deleted_at IS NULL"
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!("SELECT {COLS} FROM node WHERE name = $1 AND deleted_at IS NULL"),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get node by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!("multiple nodes named '{name}'")));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Node>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM node
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
                        "SELECT {COLS} FROM node
                         WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get node by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple nodes match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams, cluster_id: Option<Uuid>) -> Result<Vec<Node>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM node WHERE TRUE");
    if !params.show_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(cid) = cluster_id {
        sql.push_str(&format!(" AND cluster_id = '{cid}'"));
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
    .context("failed to list nodes")?;
    rows.iter().map(from_row).collect()
}

/// All live member nodes of a cluster, ordered by index.
pub async fn members(pool: &Pool, cluster_id: Uuid) -> Result<Vec<Node>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!(
                r#"SELECT {COLS} FROM node
                   WHERE cluster_id = $1 AND deleted_at IS NULL ORDER BY "index""#
            ),
            &[&cluster_id],
        )
        .await
        .context("failed to list cluster members")?;
    rows.iter().map(from_row).collect()
}

pub async fn count_by_cluster(pool: &Pool, cluster_id: Uuid) -> Result<i64> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM node WHERE cluster_id = $1 AND deleted_at IS NULL",
            &[&cluster_id],
        )
        .await
        .context("failed to count cluster members")?;
    Ok(row.get(0))
}

pub async fn count_by_profile(pool: &Pool, profile_id: Uuid) -> Result<i64> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM node WHERE profile_id = $1 AND deleted_at IS NULL",
            &[&profile_id],
        )
        .await
        .context("failed to count nodes by profile")?;
    Ok(row.get(0))
}

/// Next dense index for a joining node. Indexes are monotonic and never
/// re-packed, so this is max+1 over all rows including soft-deleted ones.
pub async fn next_index(pool: &Pool, cluster_id: Uuid) -> Result<i32> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            r#"SELECT COALESCE(MAX("index"), 0) + 1 FROM node WHERE cluster_id = $1"#,
            &[&cluster_id],
        )
        .await
        .context("failed to compute next node index")?;
    Ok(row.get(0))
}

/// Re-parent a node into a cluster (or out of one when `cluster_id` is None).
pub async fn set_membership(
    pool: &Pool,
    id: Uuid,
    cluster_id: Option<Uuid>,
    index: i32,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE node SET cluster_id = $2, "index" = $3, updated_at = $4 WHERE id = $1"#,
            &[&id, &cluster_id, &index, &now_ms()],
        )
        .await
        .context("failed to update node membership")?;
    Ok(())
}

pub async fn update_status(pool: &Pool, id: Uuid, status: NodeStatus, reason: &str) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE node SET status = $2, status_reason = $3, updated_at = $4 WHERE id = $1",
            &[&id, &status.as_str(), &reason, &now_ms()],
        )
        .await
        .context("failed to update node status")?;
    Ok(())
}

pub async fn set_provisioned(pool: &Pool, id: Uuid, physical_id: &str) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE node SET physical_id = $2, status = $3, updated_at = $4 WHERE id = $1",
            &[&id, &physical_id, &NodeStatus::Active.as_str(), &now_ms()],
        )
        .await
        .context("failed to mark node provisioned")?;
    Ok(())
}

pub async fn update_data(pool: &Pool, id: Uuid, data: &serde_json::Value) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE node SET data = $2, updated_at = $3 WHERE id = $1",
            &[&id, &data, &now_ms()],
        )
        .await
        .context("failed to update node data")?;
    Ok(())
}

/// Persist façade-editable properties.
pub async fn update(pool: &Pool, node: &Node) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE node
               SET name = $2, profile_id = $3, role = $4, metadata = $5,
                   status = $6, status_reason = $7, updated_at = $8
               WHERE id = $1"#,
            &[
                &node.id,
                &node.name,
                &node.profile_id,
                &node.role,
                &node.metadata,
                &node.status.as_str(),
                &node.status_reason,
                &now_ms(),
            ],
        )
        .await
        .context("failed to update node")?;
    Ok(())
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE node SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete node")?;
    Ok(())
}
