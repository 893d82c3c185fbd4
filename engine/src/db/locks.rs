//! Per-target mutation locks. Acquisition is a single atomic statement per
//! target; the dispatcher composes them in canonical order (cluster first,
//! then nodes by UUID) and rolls back on partial failure.

use anyhow::Context;
use deadpool_postgres::Pool;
use uuid::Uuid;

use drover_common::{Result, now_ms};

/// Try to take the lock on `target_id` for `action_id`. Exclusive locks
/// require the row to be absent; shared (read-only) holders pile onto an
/// existing non-exclusive row. Re-acquisition by the same action is a no-op
/// success so retries are safe.
pub async fn acquire(
    pool: &Pool,
    target_id: Uuid,
    action_id: Uuid,
    engine_id: Uuid,
    exclusive: bool,
) -> Result<bool> {
    let client = pool.get().await?;
    let now = now_ms();

    let inserted = client
        .execute(
            r#"INSERT INTO "lock" (target_id, action_ids, exclusive, engine_id, created_at, updated_at)
               VALUES ($1, ARRAY[$2]::uuid[], $3, $4, $5, $5)
               ON CONFLICT (target_id) DO NOTHING"#,
            &[&target_id, &action_id, &exclusive, &engine_id, &now],
        )
        .await
        .context("failed to insert lock")?;
    if inserted == 1 {
        return Ok(true);
    }

    if !exclusive {
        // Join an existing shared lock.
        let joined = client
            .execute(
                r#"UPDATE "lock"
                   SET action_ids = array_append(action_ids, $2), updated_at = $3
                   WHERE target_id = $1 AND exclusive = FALSE
                     AND NOT action_ids @> ARRAY[$2]::uuid[]"#,
                &[&target_id, &action_id, &now],
            )
            .await
            .context("failed to join shared lock")?;
        if joined == 1 {
            return Ok(true);
        }
    }

    // Held by someone else, unless it is us from a previous attempt.
    let row = client
        .query_opt(
            r#"SELECT action_ids FROM "lock" WHERE target_id = $1"#,
            &[&target_id],
        )
        .await
        .context("failed to inspect lock")?;
    let holders: Vec<Uuid> = match row {
        Some(r) => r.get("action_ids"),
        None => return Ok(false), // released between statements; caller retries
    };
    Ok(holders.contains(&action_id))
}

/// Drop `action_id` from the holder set, removing the row when it empties.
pub async fn release(pool: &Pool, target_id: Uuid, action_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    client
        .execute(
            r#"UPDATE "lock"
               SET action_ids = array_remove(action_ids, $2), updated_at = $3
               WHERE target_id = $1"#,
            &[&target_id, &action_id, &now_ms()],
        )
        .await
        .context("failed to release lock")?;
    client
        .execute(
            r#"DELETE FROM "lock" WHERE target_id = $1 AND cardinality(action_ids) = 0"#,
            &[&target_id],
        )
        .await
        .context("failed to clean up empty lock")?;
    Ok(())
}

/// Unconditional replacement. Recovery only: the previous holder is dead.
pub async fn steal(pool: &Pool, target_id: Uuid, action_id: Uuid, engine_id: Uuid) -> Result<()> {
    let client = pool.get().await?;
    let now = now_ms();
    client
        .execute(
            r#"INSERT INTO "lock" (target_id, action_ids, exclusive, engine_id, created_at, updated_at)
               VALUES ($1, ARRAY[$2]::uuid[], TRUE, $3, $4, $4)
               ON CONFLICT (target_id) DO UPDATE
               SET action_ids = ARRAY[$2]::uuid[], exclusive = TRUE,
                   engine_id = $3, updated_at = $4"#,
            &[&target_id, &action_id, &engine_id, &now],
        )
        .await
        .context("failed to steal lock")?;
    Ok(())
}

/// Break every lock held by the given (dead) engines.
pub async fn break_engine_locks(pool: &Pool, engine_ids: &[Uuid]) -> Result<u64> {
    let client = pool.get().await?;
    let n = client
        .execute(
            r#"DELETE FROM "lock" WHERE engine_id = ANY($1)"#,
            &[&engine_ids],
        )
        .await
        .context("failed to break engine locks")?;
    Ok(n)
}
