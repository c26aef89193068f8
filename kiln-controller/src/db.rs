use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Global resource version sequence shared by every kind
    sqlx::query("CREATE SEQUENCE IF NOT EXISTS kiln_resource_version")
        .execute(pool)
        .await?;

    // Create objects table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS objects (
            kind VARCHAR(64) NOT NULL,
            namespace VARCHAR(253) NOT NULL,
            name VARCHAR(253) NOT NULL,
            resource_version BIGINT NOT NULL,
            body JSONB NOT NULL,
            PRIMARY KEY (kind, namespace, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create change log table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS object_changes (
            revision BIGINT PRIMARY KEY,
            kind VARCHAR(64) NOT NULL,
            namespace VARCHAR(253) NOT NULL,
            name VARCHAR(253) NOT NULL,
            change_type VARCHAR(16) NOT NULL,
            body JSONB NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Highest revision discarded from the change log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_log_horizon (
            id SMALLINT PRIMARY KEY CHECK (id = 1),
            revision BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO change_log_horizon (id, revision) VALUES (1, 0) ON CONFLICT DO NOTHING")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_objects_kind_namespace ON objects(kind, namespace)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
