use anyhow::Context;
use deadpool_postgres::Pool;

use drover_common::{Result, now_ms};

/// Upsert the delegated credential for a (user, project) pair. Webhook
/// triggers replay requests as the original creator using this record.
pub async fn store(
    pool: &Pool,
    user: &str,
    project: &str,
    cred: &serde_json::Value,
) -> Result<()> {
    let client = pool.get().await?;
    let now = now_ms();
    client
        .execute(
            r#"INSERT INTO credential ("user", project, cred, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $4)
               ON CONFLICT ("user", project) DO UPDATE SET cred = $3, updated_at = $4"#,
            &[&user, &project, &cred, &now],
        )
        .await
        .context("failed to store credential")?;
    Ok(())
}

pub async fn get(pool: &Pool, user: &str, project: &str) -> Result<Option<serde_json::Value>> {
    let client = pool.get().await?;
    let row = client
        .query_opt(
            r#"SELECT cred FROM credential WHERE "user" = $1 AND project = $2"#,
            &[&user, &project],
        )
        .await
        .context("failed to get credential")?;
    Ok(row.map(|r| r.get("cred")))
}
