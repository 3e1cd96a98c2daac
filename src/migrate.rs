use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Schema statements, applied in order. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        url_key TEXT NOT NULL,
        default_branch TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(owner, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repo_files (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        blob_key TEXT NOT NULL,
        is_current INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        superseded_at INTEGER,
        FOREIGN KEY (project_id) REFERENCES projects(id)
    )
    "#,
    // At most one current version per (project, path).
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_repo_files_current
        ON repo_files(project_id, path) WHERE is_current = 1
    "#,
    "CREATE INDEX IF NOT EXISTS idx_repo_files_project_path ON repo_files(project_id, path)",
    r#"
    CREATE TABLE IF NOT EXISTS repo_file_chunks (
        id TEXT PRIMARY KEY,
        file_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        path TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        text_hash TEXT NOT NULL,
        embedding BLOB,
        embedding_model TEXT,
        is_current INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        invalidated_at INTEGER,
        FOREIGN KEY (file_id) REFERENCES repo_files(id)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_current
        ON repo_file_chunks(file_id, chunk_index) WHERE is_current = 1
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_project_path ON repo_file_chunks(project_id, path, is_current)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_invalidated ON repo_file_chunks(is_current, invalidated_at)",
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_runs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        trigger TEXT NOT NULL,
        phase TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER,
        FOREIGN KEY (project_id) REFERENCES projects(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_project_status ON ingestion_runs(project_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS scan_progress (
        run_id TEXT PRIMARY KEY,
        files_total INTEGER NOT NULL DEFAULT 0,
        files_indexed INTEGER NOT NULL DEFAULT 0,
        chunks INTEGER NOT NULL DEFAULT 0,
        review_done INTEGER NOT NULL DEFAULT 0,
        review_total INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (run_id) REFERENCES ingestion_runs(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_locks (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_jobs (
        id TEXT PRIMARY KEY,
        event TEXT NOT NULL,
        delivery_id TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        last_error TEXT,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_webhook_jobs_status ON webhook_jobs(status, created_at)",
    // A redelivered webhook maps onto the job already queued for it.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_webhook_jobs_delivery
        ON webhook_jobs(delivery_id) WHERE delivery_id IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commits (
        project_id TEXT NOT NULL,
        sha TEXT NOT NULL,
        message TEXT NOT NULL,
        author TEXT,
        committed_at TEXT,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (project_id, sha),
        FOREIGN KEY (project_id) REFERENCES projects(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        project_id TEXT PRIMARY KEY,
        generated_at INTEGER NOT NULL,
        trigger TEXT NOT NULL,
        FOREIGN KEY (project_id) REFERENCES projects(id)
    )
    "#,
];

/// Columns added after a table first shipped: (table, column, definition).
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[(
    "webhook_jobs",
    "next_attempt_at",
    "INTEGER NOT NULL DEFAULT 0",
)];

/// Create all tables and indexes on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    for (table, column, definition) in ADDED_COLUMNS {
        let present: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column)
                .fetch_one(pool)
                .await?;
        if present == 0 {
            sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
                .execute(pool)
                .await
                .with_context(|| format!("adding {}.{}", table, column))?;
        }
    }
    Ok(())
}

/// Connect using the configured path and create the schema. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
