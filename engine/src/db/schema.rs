use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::Result;

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await?;

    let statements: &[(&str, &str)] = &[
        (
            "profile",
            r#"
            CREATE TABLE IF NOT EXISTS profile (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                type_name TEXT NOT NULL,
                spec JSONB NOT NULL,
                permission TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "policy",
            r#"
            CREATE TABLE IF NOT EXISTS policy (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                type_name TEXT NOT NULL,
                spec JSONB NOT NULL,
                level INT NOT NULL DEFAULT 0,
                cooldown BIGINT NOT NULL DEFAULT 0,
                data JSONB NOT NULL DEFAULT '{}',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "cluster",
            r#"
            CREATE TABLE IF NOT EXISTS cluster (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                profile_id UUID NOT NULL,
                parent UUID,
                desired_capacity INT NOT NULL DEFAULT 0,
                min_size INT NOT NULL DEFAULT 0,
                max_size INT NOT NULL DEFAULT -1,
                timeout BIGINT NOT NULL DEFAULT 3600,
                status TEXT NOT NULL,
                status_reason TEXT NOT NULL DEFAULT '',
                metadata JSONB NOT NULL DEFAULT '{}',
                data JSONB NOT NULL DEFAULT '{}',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "node",
            r#"
            CREATE TABLE IF NOT EXISTS node (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                profile_id UUID NOT NULL,
                cluster_id UUID,
                role TEXT,
                "index" INT NOT NULL DEFAULT -1,
                status TEXT NOT NULL,
                status_reason TEXT NOT NULL DEFAULT '',
                physical_id TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                data JSONB NOT NULL DEFAULT '{}',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "cluster_policy",
            r#"
            CREATE TABLE IF NOT EXISTS cluster_policy (
                cluster_id UUID NOT NULL,
                policy_id UUID NOT NULL,
                priority INT NOT NULL DEFAULT 50,
                level INT NOT NULL DEFAULT 0,
                cooldown BIGINT NOT NULL DEFAULT 0,
                enabled BOOL NOT NULL DEFAULT TRUE,
                data JSONB NOT NULL DEFAULT '{}',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (cluster_id, policy_id)
            )
            "#,
        ),
        (
            "action",
            r#"
            CREATE TABLE IF NOT EXISTS action (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                target UUID NOT NULL,
                kind TEXT NOT NULL,
                cause TEXT NOT NULL,
                owner UUID,
                start_time BIGINT,
                end_time BIGINT,
                timeout BIGINT NOT NULL DEFAULT 3600,
                status TEXT NOT NULL,
                status_reason TEXT NOT NULL DEFAULT '',
                signal TEXT,
                inputs JSONB NOT NULL,
                outputs JSONB NOT NULL DEFAULT '{}',
                data JSONB NOT NULL DEFAULT '{}',
                attempts INT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "action_dependency",
            r#"
            CREATE TABLE IF NOT EXISTS action_dependency (
                action_id UUID NOT NULL,
                depends_on UUID NOT NULL,
                PRIMARY KEY (action_id, depends_on)
            )
            "#,
        ),
        (
            "event",
            r#"
            CREATE TABLE IF NOT EXISTS event (
                id UUID PRIMARY KEY,
                "timestamp" BIGINT NOT NULL,
                level TEXT NOT NULL,
                obj_id UUID NOT NULL,
                obj_type TEXT NOT NULL,
                obj_name TEXT NOT NULL DEFAULT '',
                action TEXT,
                status TEXT NOT NULL DEFAULT '',
                status_reason TEXT NOT NULL DEFAULT '',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "webhook",
            r#"
            CREATE TABLE IF NOT EXISTS webhook (
                id UUID PRIMARY KEY,
                name TEXT,
                obj_id UUID NOT NULL,
                obj_type TEXT NOT NULL,
                action TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                params JSONB NOT NULL DEFAULT '{}',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "trigger",
            r#"
            CREATE TABLE IF NOT EXISTS "trigger" (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                type_name TEXT NOT NULL,
                spec JSONB NOT NULL,
                description TEXT,
                enabled BOOL NOT NULL DEFAULT TRUE,
                state TEXT NOT NULL DEFAULT 'ok',
                severity TEXT NOT NULL DEFAULT 'low',
                "user" TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )
            "#,
        ),
        (
            "health_registry",
            r#"
            CREATE TABLE IF NOT EXISTS health_registry (
                id UUID PRIMARY KEY,
                cluster_id UUID,
                check_type TEXT NOT NULL,
                check_interval BIGINT NOT NULL DEFAULT 0,
                params JSONB NOT NULL DEFAULT '{}',
                engine_id UUID NOT NULL,
                last_heartbeat BIGINT NOT NULL
            )
            "#,
        ),
        (
            "lock",
            r#"
            CREATE TABLE IF NOT EXISTS "lock" (
                target_id UUID PRIMARY KEY,
                action_ids UUID[] NOT NULL,
                exclusive BOOL NOT NULL DEFAULT TRUE,
                engine_id UUID NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
        ),
        (
            "credential",
            r#"
            CREATE TABLE IF NOT EXISTS credential (
                "user" TEXT NOT NULL,
                project TEXT NOT NULL,
                cred JSONB NOT NULL DEFAULT '{}',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY ("user", project)
            )
            "#,
        ),
    ];

    for (name, ddl) in statements {
        client
            .execute(*ddl, &[])
            .await
            .with_context(|| format!("failed to create {name} table"))?;
    }

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_action_status ON action (status) WHERE deleted_at IS NULL",
            &[],
        )
        .await
        .context("failed to create action status index")?;
    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_node_cluster ON node (cluster_id) WHERE deleted_at IS NULL",
            &[],
        )
        .await
        .context("failed to create node cluster index")?;

    tracing::info!("database schema initialized");
    Ok(())
}
