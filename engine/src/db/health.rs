//! Shared health registry. Engines publish their own liveness here as
//! ENGINE_STATUS rows; the same table carries per-cluster health check
//! registrations. Recovery reads stale heartbeats to decide whose work may
//! be stolen.

use anyhow::Context;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use drover_common::{Result, now_ms};

use crate::models::{ENGINE_STATUS_CHECK, HealthRegistry};

const COLS: &str =
    "id, cluster_id, check_type, check_interval, params, engine_id, last_heartbeat";

fn from_row(row: &Row) -> HealthRegistry {
    HealthRegistry {
        id: row.get("id"),
        cluster_id: row.get("cluster_id"),
        check_type: row.get("check_type"),
        check_interval: row.get("check_interval"),
        params: row.get("params"),
        engine_id: row.get("engine_id"),
        last_heartbeat: row.get("last_heartbeat"),
    }
}

/// Register this engine's liveness row; idempotent per engine.
pub async fn engine_register(pool: &Pool, engine_id: Uuid, interval_ms: i64) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"INSERT INTO health_registry
                   (id, cluster_id, check_type, check_interval, params, engine_id, last_heartbeat)
               VALUES ($1, NULL, $2, $3, '{}', $4, $5)
               ON CONFLICT (id) DO UPDATE SET last_heartbeat = $5"#,
            &[
                &engine_id, // liveness rows use the engine id as the row id
                &ENGINE_STATUS_CHECK,
                &interval_ms,
                &engine_id,
                &now_ms(),
            ],
        )
        .await
        .context("failed to register engine")?;
    Ok(())
}

pub async fn engine_heartbeat(pool: &Pool, engine_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "UPDATE health_registry SET last_heartbeat = $2
             WHERE engine_id = $1 AND check_type = $3",
            &[&engine_id, &now_ms(), &ENGINE_STATUS_CHECK],
        )
        .await
        .context("failed to heartbeat")?;
    Ok(())
}

/// Engines whose liveness row is older than the cutoff. Excludes the caller
/// so an engine never declares itself dead.
pub async fn stale_engines(pool: &Pool, self_id: Uuid, cutoff_ms: i64) -> Result<Vec<Uuid>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            "SELECT engine_id FROM health_registry
             WHERE check_type = $1 AND engine_id <> $2 AND last_heartbeat < $3",
            &[&ENGINE_STATUS_CHECK, &self_id, &cutoff_ms],
        )
        .await
        .context("failed to list stale engines")?;
    Ok(rows.iter().map(|r| r.get("engine_id")).collect())
}

pub async fn remove_engines(pool: &Pool, engine_ids: &[Uuid]) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "DELETE FROM health_registry WHERE check_type = $1 AND engine_id = ANY($2)",
            &[&ENGINE_STATUS_CHECK, &engine_ids],
        )
        .await
        .context("failed to remove stale engines")?;
    Ok(())
}

/// Health-check registrations claimed by an engine for a cluster.
pub async fn claim_cluster_check(
    pool: &Pool,
    cluster_id: Uuid,
    check_type: &str,
    interval_ms: i64,
    params: &serde_json::Value,
    engine_id: Uuid,
) -> Result<HealthRegistry> {
    let client = pool.get().await?;
    let row = client
        .query_one(
            &format!(
                "INSERT INTO health_registry
                     (id, cluster_id, check_type, check_interval, params, engine_id, last_heartbeat)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 RETURNING {COLS}"
            ),
            &[
                &Uuid::new_v4(),
                &cluster_id,
                &check_type,
                &interval_ms,
                &params,
                &engine_id,
                &now_ms(),
            ],
        )
        .await
        .context("failed to claim health check")?;
    Ok(from_row(&row))
}

pub async fn cluster_checks(pool: &Pool, cluster_id: Uuid) -> Result<Vec<HealthRegistry>> {
    let client = pool.get().await?;
    let rows = client
        .query(
            &format!("SELECT {COLS} FROM health_registry WHERE cluster_id = $1"),
            &[&cluster_id],
        )
        .await
        .context("failed to list health checks")?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn remove_cluster_checks(pool: &Pool, cluster_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            "DELETE FROM health_registry WHERE cluster_id = $1",
            &[&cluster_id],
        )
        .await
        .context("failed to remove health checks")?;
    Ok(())
}
