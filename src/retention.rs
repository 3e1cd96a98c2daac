//! Retention sweep for invalidated chunks.
//!
//! Chunks are invalidated, never deleted, when their file changes or goes
//! away. This sweep removes the ones invalidated more than
//! `retention.chunk_days` ago. File version rows are kept forever.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::RetentionConfig;
use crate::db::now_ts;
use crate::store;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SweepReport {
    pub cutoff: i64,
    pub chunks_deleted: u64,
}

/// Delete chunks invalidated before `now - chunk_days`.
pub async fn sweep(pool: &SqlitePool, config: &RetentionConfig) -> Result<SweepReport> {
    let cutoff = now_ts() - config.chunk_days.max(0) * 86_400;
    let chunks_deleted = store::delete_invalidated_chunks(pool, cutoff).await?;
    info!(cutoff, chunks_deleted, "retention sweep finished");
    Ok(SweepReport {
        cutoff,
        chunks_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextChunk;
    use crate::testutil::test_pool;

    fn chunk(i: i64) -> TextChunk {
        TextChunk {
            path: "a.md".to_string(),
            chunk_index: i,
            text: format!("chunk {}", i),
            hash: format!("h{}", i),
        }
    }

    #[tokio::test]
    async fn only_old_invalidated_chunks_are_deleted() {
        let (_dir, pool) = test_pool().await;
        let project = store::insert_project(&pool, "acme", "docs", "https://github.com/acme/docs", "main")
            .await
            .unwrap();
        let v1 = store::insert_file_version(&pool, &project.id, "a.md", "s1", 10, "k1")
            .await
            .unwrap();
        store::insert_chunks(&pool, &v1, &[chunk(0), chunk(1)], None, None)
            .await
            .unwrap();
        let v2 = store::insert_file_version(&pool, &project.id, "a.md", "s2", 10, "k2")
            .await
            .unwrap();
        store::insert_chunks(&pool, &v2, &[chunk(0)], None, None).await.unwrap();

        let config = RetentionConfig { chunk_days: 30 };
        assert_eq!(sweep(&pool, &config).await.unwrap().chunks_deleted, 0);

        sqlx::query("UPDATE repo_file_chunks SET invalidated_at = 1 WHERE is_current = 0")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(sweep(&pool, &config).await.unwrap().chunks_deleted, 2);
        assert_eq!(store::current_chunks(&pool, &v2.id).await.unwrap().len(), 1);
    }
}
