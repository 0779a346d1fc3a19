//! Connection pool and schema setup

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
    // Jobs are never deleted; finished rows back the dedup lookup
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job (
            job_id BIGSERIAL PRIMARY KEY,
            job_uuid UUID NOT NULL UNIQUE,
            status VARCHAR(20) NOT NULL,
            workflow TEXT NOT NULL,
            workflow_version TEXT NOT NULL,
            workflow_path TEXT NOT NULL,
            job_hash TEXT NOT NULL,
            arguments JSONB NOT NULL DEFAULT '{}',
            extra_files JSONB NOT NULL DEFAULT '{}',
            provision_uuid UUID,
            stdout TEXT,
            stderr TEXT,
            end_user TEXT,
            flavour TEXT,
            create_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            update_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provision (
            provision_id BIGSERIAL PRIMARY KEY,
            provision_uuid UUID NOT NULL,
            status VARCHAR(20) NOT NULL,
            cores INTEGER NOT NULL DEFAULT 0,
            mem_gb INTEGER NOT NULL DEFAULT 0,
            storage_gb INTEGER NOT NULL DEFAULT 0,
            job_uuid UUID,
            ip_address TEXT,
            create_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            update_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_status ON job(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_hash ON job(job_hash)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provision_uuid ON provision(provision_uuid)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provision_job_uuid ON provision(job_uuid)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_provision_ip_address ON provision(ip_address, provision_id DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
