//! Application context: every collaborator the pipeline needs, built once.
//!
//! The CLI and the HTTP server both construct one [`AppContext`] at startup
//! and pass it down explicitly. Tests build one from fakes with
//! [`AppContext::from_parts`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use crate::analysis::create_analyzer;
use crate::config::{Config, Secrets};
use crate::db;
use crate::embedding::{create_embedder, EmbeddingBatcher};
use crate::github::GitHubClient;
use crate::lock::JobLocks;
use crate::migrate::migrate_pool;
use crate::storage::create_blob_store;
use crate::traits::{Analyzer, BlobStore, Embedder, SourceHost};

#[derive(Clone)]
pub struct AppContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub secrets: Arc<Secrets>,
    pub host: Arc<dyn SourceHost>,
    pub blobs: Arc<dyn BlobStore>,
    pub embedder: EmbeddingBatcher,
    pub analyzer: Arc<dyn Analyzer>,
    pub locks: JobLocks,
}

impl AppContext {
    /// Connect, migrate, build the production adapters and verify storage.
    pub async fn build(config: Config, secrets: Secrets) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate_pool(&pool).await?;

        let host: Arc<dyn SourceHost> = Arc::new(GitHubClient::new(&config.github, &secrets)?);
        let blobs = create_blob_store(&config, &secrets)?;
        let embedder = create_embedder(&config.embedding, &secrets)?;
        let analyzer = create_analyzer(&config.analysis, &secrets)?;

        blobs
            .ensure_ready()
            .await
            .with_context(|| format!("{} blob store is not usable", blobs.name()))?;
        info!(
            storage = blobs.name(),
            embedding = %config.embedding.provider,
            analysis = analyzer.is_enabled(),
            "context ready"
        );

        Ok(Self::from_parts(pool, config, secrets, host, blobs, embedder, analyzer))
    }

    pub fn from_parts(
        pool: SqlitePool,
        config: Config,
        secrets: Secrets,
        host: Arc<dyn SourceHost>,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn Embedder>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let locks = JobLocks::new(
            pool.clone(),
            Duration::from_millis(config.sync.lock_retry_millis),
        );
        let embedder = EmbeddingBatcher::from_config(embedder, &config.embedding);
        Self {
            pool,
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            host,
            blobs,
            embedder,
            analyzer,
            locks,
        }
    }
}
