use sqlx::SqlitePool;
use tracing::debug;

use crate::error::Result;

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            source TEXT NOT NULL,
            path TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            last_synced_at INTEGER NOT NULL,
            PRIMARY KEY (source, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Last successful reconciliation per source (staleness input)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            source TEXT PRIMARY KEY,
            synced_at INTEGER NOT NULL,
            upserted INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distillation_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            preset TEXT NOT NULL,
            status TEXT NOT NULL,
            total_files INTEGER NOT NULL DEFAULT 0,
            processed_files INTEGER NOT NULL DEFAULT 0,
            successful_files INTEGER NOT NULL DEFAULT 0,
            total_input_tokens INTEGER NOT NULL DEFAULT 0,
            total_output_tokens INTEGER NOT NULL DEFAULT 0,
            batch_handle TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distillation_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            original_content TEXT NOT NULL,
            distilled_content TEXT,
            success INTEGER NOT NULL,
            error_message TEXT,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (job_id) REFERENCES distillation_jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distilled_artifacts (
            group_name TEXT NOT NULL,
            version TEXT NOT NULL,
            content TEXT NOT NULL,
            size_kb REAL NOT NULL,
            document_count INTEGER NOT NULL,
            source_job_id INTEGER,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (group_name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_results_job_id ON distillation_results(job_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_started_at ON distillation_jobs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    debug!("migrations applied");
    Ok(())
}
