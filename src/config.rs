//! TOML configuration and environment secrets.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! Secrets are never read from the file; see [`Secrets`].
//!
//! ```toml
//! [db]
//! path = "./data/docmirror.sqlite"
//!
//! [chunking]
//! window_chars = 1000
//! overlap_chars = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [storage]
//! provider = "s3"
//! bucket = "doc-mirror"
//! region = "us-east-1"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//! public_url = "https://mirror.example.com"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. The server, worker and detached review tasks share it.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
            max_chunks: default_max_chunks(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    10
}

fn default_window_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_max_chunks() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_millis")]
    pub retry_base_millis: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_attempts: default_max_attempts(),
            retry_base_millis: default_retry_base_millis(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_millis() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_github_api")]
    pub api_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_millis")]
    pub retry_base_millis: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            max_attempts: default_max_attempts(),
            retry_base_millis: default_retry_base_millis(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"filesystem"` or `"s3"`.
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    /// Root directory for the filesystem provider.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack). Uses path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            root: default_storage_root(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_storage_provider() -> String {
    "filesystem".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Files processed concurrently within one batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Progress counters are written every this many files.
    #[serde(default = "default_flush_every")]
    pub progress_flush_every: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: i64,
    #[serde(default = "default_lock_retry_millis")]
    pub lock_retry_millis: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            concurrency: default_concurrency(),
            progress_flush_every: default_flush_every(),
            lock_lease_secs: default_lock_lease_secs(),
            lock_retry_millis: default_lock_retry_millis(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.mdx".to_string(),
        "**/*.rst".to_string(),
        "**/*.txt".to_string(),
    ]
}
fn default_max_file_bytes() -> u64 {
    1_000_000
}
fn default_concurrency() -> usize {
    3
}
fn default_flush_every() -> u64 {
    3
}
fn default_lock_lease_secs() -> i64 {
    600
}
fn default_lock_retry_millis() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_batch")]
    pub batch_size: i64,
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// `running` jobs untouched for this long are returned to `pending`.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: i64,
    /// First retry waits this long; each further retry doubles it.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

impl QueueConfig {
    /// Backoff between attempts of a failed job.
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1) as u32,
            base_delay: Duration::from_secs(self.retry_base_secs),
            max_delay: Duration::from_secs(self.retry_max_secs),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_queue_batch(),
            max_retries: default_queue_max_retries(),
            poll_secs: default_poll_secs(),
            stale_after_secs: default_stale_secs(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

fn default_retry_base_secs() -> u64 {
    30
}
fn default_retry_max_secs() -> u64 {
    3600
}
fn default_queue_batch() -> i64 {
    5
}
fn default_queue_max_retries() -> i64 {
    3
}
fn default_poll_secs() -> u64 {
    10
}
fn default_stale_secs() -> i64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// `"inline"` processes pushes in a detached task; `"queue"` persists a job.
    #[serde(default = "default_webhook_mode")]
    pub mode: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            mode: default_webhook_mode(),
        }
    }
}

impl WebhookConfig {
    pub fn is_queued(&self) -> bool {
        self.mode == "queue"
    }
}

fn default_webhook_mode() -> String {
    "queue".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Analysis service endpoint. Analysis is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Paths whose change always forces regeneration.
    #[serde(default = "default_core_paths")]
    pub core_paths: Vec<String>,
    #[serde(default = "default_stale_hours")]
    pub stale_after_hours: i64,
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            core_paths: default_core_paths(),
            stale_after_hours: default_stale_hours(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

fn default_core_paths() -> Vec<String> {
    vec![
        "README.md".to_string(),
        "docs/README.md".to_string(),
        "docs/index.md".to_string(),
        "CONTRIBUTING.md".to_string(),
    ]
}
fn default_stale_hours() -> i64 {
    24 * 7
}
fn default_analysis_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_chunk_days")]
    pub chunk_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            chunk_days: default_chunk_days(),
        }
    }
}

fn default_chunk_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL, used when installing webhooks.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_trigger_header")]
    pub internal_trigger_header: String,
    #[serde(default = "default_stream_max_secs")]
    pub stream_max_secs: u64,
    #[serde(default = "default_stream_heartbeat_secs")]
    pub stream_heartbeat_secs: u64,
    #[serde(default = "default_stream_poll_millis")]
    pub stream_poll_millis: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
            internal_trigger_header: default_trigger_header(),
            stream_max_secs: default_stream_max_secs(),
            stream_heartbeat_secs: default_stream_heartbeat_secs(),
            stream_poll_millis: default_stream_poll_millis(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_trigger_header() -> String {
    "x-internal-trigger".to_string()
}
fn default_stream_max_secs() -> u64 {
    55
}
fn default_stream_heartbeat_secs() -> u64 {
    15
}
fn default_stream_poll_millis() -> u64 {
    2000
}

/// Credentials read from the environment at startup.
///
/// | Variable | Used for |
/// |----------|----------|
/// | `GITHUB_TOKEN` | source host API |
/// | `OPENAI_API_KEY` | embedding API (`openai` provider) |
/// | `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN` | S3 storage |
/// | `GITHUB_WEBHOOK_SECRET` | webhook signature verification |
/// | `CRON_SECRET` | bearer token for trigger endpoints |
/// | `ANALYSIS_TOKEN` | analysis service |
#[derive(Clone, Default)]
pub struct Secrets {
    pub github_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub cron_secret: Option<String>,
    pub analysis_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            github_token: var("GITHUB_TOKEN"),
            openai_api_key: var("OPENAI_API_KEY"),
            aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            aws_session_token: var("AWS_SESSION_TOKEN"),
            webhook_secret: var("GITHUB_WEBHOOK_SECRET"),
            cron_secret: var("CRON_SECRET"),
            analysis_token: var("ANALYSIS_TOKEN"),
        }
    }
}

// Secrets must never end up in logs.
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |v: &Option<String>| if v.is_some() { "set" } else { "unset" };
        f.debug_struct("Secrets")
            .field("github_token", &mark(&self.github_token))
            .field("openai_api_key", &mark(&self.openai_api_key))
            .field("aws_access_key_id", &mark(&self.aws_access_key_id))
            .field("webhook_secret", &mark(&self.webhook_secret))
            .field("cron_secret", &mark(&self.cron_secret))
            .field("analysis_token", &mark(&self.analysis_token))
            .finish()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    // Validate chunking
    if config.chunking.window_chars == 0 {
        anyhow::bail!("chunking.window_chars must be > 0");
    }
    if config.chunking.max_chunks == 0 {
        anyhow::bail!("chunking.max_chunks must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.max_attempts == 0 {
        anyhow::bail!("embedding.max_attempts must be >= 1");
    }

    // Validate storage
    match config.storage.provider.as_str() {
        "filesystem" => {}
        "s3" => {
            if config.storage.bucket.is_empty() {
                anyhow::bail!("storage.bucket must be set when provider is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage provider: '{}'. Must be filesystem or s3.",
            other
        ),
    }

    // Validate sync
    if config.sync.concurrency == 0 {
        anyhow::bail!("sync.concurrency must be >= 1");
    }
    if config.sync.progress_flush_every == 0 {
        anyhow::bail!("sync.progress_flush_every must be >= 1");
    }
    if config.sync.lock_lease_secs <= 0 {
        anyhow::bail!("sync.lock_lease_secs must be > 0");
    }

    match config.webhook.mode.as_str() {
        "inline" | "queue" => {}
        other => anyhow::bail!("Unknown webhook.mode: '{}'. Must be inline or queue.", other),
    }

    if config.queue.batch_size < 1 {
        anyhow::bail!("queue.batch_size must be >= 1");
    }
    if config.queue.max_retries < 1 {
        anyhow::bail!("queue.max_retries must be >= 1");
    }

    if config.queue.retry_max_secs < config.queue.retry_base_secs {
        anyhow::bail!("queue.retry_max_secs must be >= queue.retry_base_secs");
    }

    if config.server.stream_poll_millis == 0
        || config.server.stream_max_secs == 0
        || config.server.stream_heartbeat_secs == 0
    {
        anyhow::bail!(
            "server.stream_poll_millis, server.stream_max_secs and server.stream_heartbeat_secs must be > 0"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.window_chars, 1000);
        assert_eq!(cfg.chunking.overlap_chars, 200);
        assert_eq!(cfg.sync.concurrency, 3);
        assert_eq!(cfg.embedding.max_attempts, 3);
        assert!(!cfg.embedding.is_enabled());
        assert!(cfg.webhook.is_queued());
        assert_eq!(cfg.server.stream_max_secs, 55);
        assert_eq!(cfg.storage.provider, "filesystem");
    }

    #[test]
    fn rejects_unknown_embedding_provider() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn enabled_embedding_requires_model() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn s3_requires_bucket() {
        let err = parse_config("[db]\npath = \"x\"\n[storage]\nprovider = \"s3\"\n").unwrap_err();
        assert!(err.to_string().contains("storage.bucket"));
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[chunking]\nwindow_chars = 0\n").unwrap_err();
        assert!(err.to_string().contains("window_chars"));
    }

    #[test]
    fn zero_stream_intervals_are_rejected() {
        for key in ["stream_heartbeat_secs", "stream_max_secs", "stream_poll_millis"] {
            let toml = format!("[db]\npath = \"x\"\n[server]\n{} = 0\n", key);
            let err = parse_config(&toml).unwrap_err();
            assert!(err.to_string().contains(key), "{} accepted as 0", key);
        }
    }

    #[test]
    fn queue_backoff_doubles_from_base() {
        let cfg = parse_config("[db]\npath = \"x\"\n[queue]\nretry_base_secs = 10\n").unwrap();
        let backoff = cfg.queue.backoff();
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(20));
        assert_eq!(backoff.max_delay, Duration::from_secs(3600));

        let err = parse_config("[db]\npath = \"x\"\n[queue]\nretry_base_secs = 10\nretry_max_secs = 5\n")
            .unwrap_err();
        assert!(err.to_string().contains("retry_max_secs"));
    }

    #[test]
    fn secrets_debug_hides_values() {
        let secrets = Secrets {
            webhook_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let out = format!("{:?}", secrets);
        assert!(!out.contains("hunter2"));
        assert!(out.contains("webhook_secret: \"set\""));
    }
}
