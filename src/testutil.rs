//! Helpers shared by unit tests.

use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::config::parse_config;
use crate::db;
use crate::migrate::migrate_pool;

/// A migrated database in a fresh temp directory. Keep the `TempDir` alive.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!("[db]\npath = {:?}\n", dir.path().join("test.sqlite"));
    let config = parse_config(&toml).unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    (dir, pool)
}
