use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Error, Result, now_ms};

use crate::models::{ClusterPolicy, Policy};

use super::ListParams;

const COLS: &str = r#"id, name, type_name, spec, level, cooldown, data, "user", project, domain,
    created_at, updated_at, deleted_at"#;

fn from_row(row: &Row) -> Result<Policy> {
    Ok(Policy {
        id: row.get("id"),
        name: row.get("name"),
        type_name: row.get("type_name"),
        spec: row.get("spec"),
        level: row.get("level"),
        cooldown: row.get("cooldown"),
        data: row.get("data"),
        user: row.get("user"),
        project: row.get("project"),
        domain: row.get("domain"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub async fn insert(pool: &Pool, policy: &Policy) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                "INSERT INTO policy ({COLS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)"
            ),
            &[
                &policy.id,
                &policy.name,
                &policy.type_name,
                &policy.spec,
                &policy.level,
                &policy.cooldown,
                &policy.data,
                &policy.user,
                &policy.project,
                &policy.domain,
                &policy.created_at,
                &policy.updated_at,
                &policy.deleted_at,
            ],
        )
        .await
        .context("failed to insert policy")?;
    Ok(())
}

pub async fn get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Option<Policy>> {
    let client = pool.get().await?;
    let filter = if show_deleted {
        ""
    } else {
        "AND deleted_at IS NULL"
    };
    let row = client
        .query_opt(
            &format!("SELECT {COLS} FROM policy WHERE id = $1 {filter}"),
            &[&id],
        )
        .await
        .context("failed to get policy")?;
    row.as_ref().map(from_row).transpose()
}

pub async fn get_by_name(pool: &Pool, project: Option<&str>, name: &str) -> Result<Option<Policy>> {
    let client = pool.get().await?;
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM policy
                         WHERE name = $1 AND project = $2 AND deleted_at IS NULL"
                    ),
                    &[&name, &p],
                )
                .await
        }
        None => {
            client
                .query(
                    &format!("SELECT {COLS} FROM policy WHERE name = $1 AND deleted_at IS NULL"),
                    &[&name],
                )
                .await
        }
    }
    .context("failed to get policy by name")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!("multiple policies named '{name}'")));
    }
    rows.first().map(from_row).transpose()
}

pub async fn get_by_short_id(
    pool: &Pool,
    project: Option<&str>,
    prefix: &str,
) -> Result<Option<Policy>> {
    let client = pool.get().await?;
    let pattern = format!("{prefix}%");
    let rows = match project {
        Some(p) => {
            client
                .query(
                    &format!(
                        "SELECT {COLS} FROM policy
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
                        "SELECT {COLS} FROM policy
                         WHERE id::text LIKE $1 AND deleted_at IS NULL LIMIT 2"
                    ),
                    &[&pattern],
                )
                .await
        }
    }
    .context("failed to get policy by short id")?;
    if rows.len() > 1 {
        return Err(Error::BadRequest(format!(
            "multiple policies match short id '{prefix}'"
        )));
    }
    rows.first().map(from_row).transpose()
}

pub async fn list(pool: &Pool, params: &ListParams) -> Result<Vec<Policy>> {
    let client = pool.get().await?;
    let mut sql = format!("SELECT {COLS} FROM policy WHERE TRUE");
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
    .context("failed to list policies")?;
    rows.iter().map(from_row).collect()
}

pub async fn update_properties(
    pool: &Pool,
    id: Uuid,
    name: &str,
    level: i32,
    cooldown: i64,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE policy SET name = $2, level = $3, cooldown = $4, updated_at = $5 WHERE id = $1",
            &[&id, &name, &level, &cooldown, &now_ms()],
        )
        .await
        .context("failed to update policy")?;
    Ok(())
}

pub async fn soft_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE policy SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to delete policy")?;
    Ok(())
}

// ---- cluster-policy bindings ----

const BINDING_COLS: &str =
    "cluster_id, policy_id, priority, level, cooldown, enabled, data, created_at, updated_at";

fn binding_from_row(row: &Row) -> ClusterPolicy {
    ClusterPolicy {
        cluster_id: row.get("cluster_id"),
        policy_id: row.get("policy_id"),
        priority: row.get("priority"),
        level: row.get("level"),
        cooldown: row.get("cooldown"),
        enabled: row.get("enabled"),
        data: row.get("data"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn binding_insert(pool: &Pool, binding: &ClusterPolicy) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            &format!(
                "INSERT INTO cluster_policy ({BINDING_COLS})
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
            ),
            &[
                &binding.cluster_id,
                &binding.policy_id,
                &binding.priority,
                &binding.level,
                &binding.cooldown,
                &binding.enabled,
                &binding.data,
                &binding.created_at,
                &binding.updated_at,
            ],
        )
        .await
        .context("failed to insert policy binding")?;
    Ok(())
}

pub async fn binding_get(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
) -> Result<Option<ClusterPolicy>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            &format!(
                "SELECT {BINDING_COLS} FROM cluster_policy
                 WHERE cluster_id = $1 AND policy_id = $2"
            ),
            &[&cluster_id, &policy_id],
        )
        .await
        .context("failed to get policy binding")?;
    Ok(row.as_ref().map(binding_from_row))
}

/// Bindings for a cluster ordered the way hooks fire: priority ascending,
/// ties broken by attachment time.
pub async fn bindings_for_cluster(pool: &Pool, cluster_id: Uuid) -> Result<Vec<ClusterPolicy>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!(
                "SELECT {BINDING_COLS} FROM cluster_policy
                 WHERE cluster_id = $1 ORDER BY priority, created_at"
            ),
            &[&cluster_id],
        )
        .await
        .context("failed to list policy bindings")?;
    Ok(rows.iter().map(binding_from_row).collect())
}

pub async fn bindings_for_policy(pool: &Pool, policy_id: Uuid) -> Result<Vec<ClusterPolicy>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!("SELECT {BINDING_COLS} FROM cluster_policy WHERE policy_id = $1"),
            &[&policy_id],
        )
        .await
        .context("failed to list bindings by policy")?;
    Ok(rows.iter().map(binding_from_row).collect())
}

pub async fn binding_update(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
    priority: Option<i32>,
    level: Option<i32>,
    cooldown: Option<i64>,
    enabled: Option<bool>,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE cluster_policy
               SET priority = COALESCE($3, priority),
                   level = COALESCE($4, level),
                   cooldown = COALESCE($5, cooldown),
                   enabled = COALESCE($6, enabled),
                   updated_at = $7
               WHERE cluster_id = $1 AND policy_id = $2"#,
            &[
                &cluster_id,
                &policy_id,
                &priority,
                &level,
                &cooldown,
                &enabled,
                &now_ms(),
            ],
        )
        .await
        .context("failed to update policy binding")?;
    Ok(())
}

pub async fn binding_update_data(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
    data: &serde_json::Value,
) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE cluster_policy SET data = $3, updated_at = $4
             WHERE cluster_id = $1 AND policy_id = $2",
            &[&cluster_id, &policy_id, &data, &now_ms()],
        )
        .await
        .context("failed to update binding data")?;
    Ok(())
}

pub async fn binding_delete(pool: &Pool, cluster_id: Uuid, policy_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "DELETE FROM cluster_policy WHERE cluster_id = $1 AND policy_id = $2",
            &[&cluster_id, &policy_id],
        )
        .await
        .context("failed to delete policy binding")?;
    Ok(())
}
