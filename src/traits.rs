//! Extension seams for the external collaborators of the pipeline.
//!
//! The synchronization pipeline talks to four outside systems, each behind a
//! trait so production adapters and in-test fakes are interchangeable:
//!
//! ```text
//!             ┌───────────────┐
//!  trigger ──▶│   ingest      │
//!             └──────┬────────┘
//!       ┌────────────┼──────────────┬─────────────┐
//!       ▼            ▼              ▼             ▼
//!  SourceHost    BlobStore       Embedder      Analyzer
//!  (github)      (storage)       (embedding)   (analysis)
//! ```
//!
//! All traits are object safe and used as `Arc<dyn Trait>` from
//! [`AppContext`](crate::context::AppContext).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::RepoRef;

// ═══════════════════════════════════════════════════════════════════════
// Source host
// ═══════════════════════════════════════════════════════════════════════

/// Repository metadata returned by the source host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
    pub html_url: String,
    pub default_branch: String,
}

/// One blob entry of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    /// Git blob SHA, used as the content hash.
    pub sha: String,
    pub size: u64,
}

/// A recursive tree listing at some ref.
#[derive(Debug, Clone)]
pub struct RepoTree {
    /// SHA of the tree itself.
    pub sha: String,
    pub entries: Vec<TreeEntry>,
    /// The host truncated the listing; removals must not be inferred from it.
    pub truncated: bool,
}

/// File content fetched at a ref.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub path: String,
    pub sha: String,
    pub bytes: Vec<u8>,
}

/// Status of a path in a commit comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

/// One file entry of a commit comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    pub status: ChangeStatus,
    /// Previous path for renames.
    pub previous_path: Option<String>,
}

/// Commit metadata, either from the host's commit list or a push payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: Option<String>,
    /// ISO-8601 timestamp as reported by the host.
    pub committed_at: Option<String>,
}

/// A webhook registered on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInfo {
    pub id: u64,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

/// The source-control host (GitHub REST v3 in production).
///
/// Implementations classify rate limits, 5xx responses and network errors
/// as [`ErrorKind::TransientExternal`](crate::error::ErrorKind) so callers
/// can retry them.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn repository(&self, repo: &RepoRef) -> Result<RepoInfo>;

    /// Recursive blob listing of `git_ref`.
    async fn tree(&self, repo: &RepoRef, git_ref: &str) -> Result<RepoTree>;

    /// Content of `path` at `git_ref`. `Ok(None)` when the path does not exist there.
    async fn file(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<Option<FileContent>>;

    /// Files changed between two commits.
    async fn compare(&self, repo: &RepoRef, base: &str, head: &str) -> Result<Vec<ChangedFile>>;

    /// Most recent commits on `branch`, newest first.
    async fn commits(&self, repo: &RepoRef, branch: &str, limit: usize) -> Result<Vec<CommitInfo>>;

    async fn create_hook(&self, repo: &RepoRef, url: &str, secret: &str) -> Result<HookInfo>;

    async fn list_hooks(&self, repo: &RepoRef) -> Result<Vec<HookInfo>>;

    async fn delete_hook(&self, repo: &RepoRef, hook_id: u64) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Blob store
// ═══════════════════════════════════════════════════════════════════════

/// Content-addressed object storage for file blobs.
///
/// Keys look like `{project_id}/{content_hash}/{filename}`; see
/// [`blob_key`](crate::storage::blob_key).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend name for logs (`"filesystem"`, `"s3"`).
    fn name(&self) -> &str;

    /// Verify the backing bucket/directory exists, creating it if needed.
    /// Called once at startup.
    async fn ensure_ready(&self) -> Result<()>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Embedder
// ═══════════════════════════════════════════════════════════════════════

/// A backend that turns texts into vectors with one request per call.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model tag stored alongside each vector.
    fn model_name(&self) -> &str;

    /// `false` for the disabled backend; chunks are then stored without vectors.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Analyzer
// ═══════════════════════════════════════════════════════════════════════

/// Opaque AI analysis generator for a project.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Regenerate the analysis for `project_id`. `reason` is a short tag
    /// such as `"import"` or `"core_docs_changed"`.
    async fn regenerate(&self, project_id: &str, repo: &RepoRef, reason: &str) -> Result<()>;
}
