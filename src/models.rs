//! Core data models used throughout doc-mirror.
//!
//! These types mirror the rows stored in SQLite (projects, file versions,
//! chunk sets, runs, locks, queued webhook jobs) plus the in-flight values
//! the pipeline passes between stages.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A tracked repository.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub default_branch: String,
    pub created_at: i64,
}

impl Project {
    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn repo_ref(&self) -> RepoRef {
        RepoRef {
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }
}

/// Owner/name pair identifying a repository on the source host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = anyhow::Error;

    /// Accepts `owner/name`, `https://host/owner/name(.git)` or `git@host:owner/name.git`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim().trim_end_matches('/').trim_end_matches(".git");
        let path = if let Some(rest) = trimmed.split_once("://").map(|(_, r)| r) {
            rest.split_once('/').map(|(_, p)| p).unwrap_or("")
        } else if let Some((_, rest)) = trimmed.split_once(':').filter(|(h, _)| h.contains('@')) {
            rest
        } else {
            trimmed
        };

        let mut parts = path.split('/').filter(|p| !p.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) => Ok(RepoRef::new(owner, name)),
            _ => anyhow::bail!("expected a repository as owner/name or URL, got '{}'", s),
        }
    }
}

/// Normalize a repository URL for lookups: lowercase, no scheme, no `.git`, no trailing slash.
///
/// `git@github.com:Org/Repo.git` and `https://github.com/org/repo/` both become
/// `github.com/org/repo`.
pub fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/').trim_end_matches(".git");
    let without_scheme = match trimmed.split_once("://") {
        Some((_, rest)) => rest.to_string(),
        None => match trimmed.split_once('@') {
            Some((_, rest)) => rest.replacen(':', "/", 1),
            None => trimmed.to_string(),
        },
    };
    let without_auth = match without_scheme.split_once('@') {
        Some((_, rest)) => rest.to_string(),
        None => without_scheme,
    };
    without_auth.to_lowercase()
}

/// One version of one file.
#[derive(Debug, Clone, Serialize)]
pub struct RepoFile {
    pub id: String,
    pub project_id: String,
    pub path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub blob_key: String,
    pub is_current: bool,
    pub created_at: i64,
}

/// One stored chunk of a file version.
#[derive(Debug, Clone)]
pub struct RepoFileChunk {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub is_current: bool,
}

/// A window of text produced by the chunker, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub path: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Stage of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Indexing,
    Embedding,
    Review,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Indexing => "indexing",
            RunPhase::Embedding => "embedding",
            RunPhase::Review => "review",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    /// Legal forward moves: indexing → embedding → review → done, and any
    /// non-terminal phase → failed. Re-entering the current phase is allowed
    /// so a resumed run can restart its stage.
    pub fn can_advance_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (a, b) if *a == b => !a.is_terminal(),
            (Indexing, Embedding) | (Embedding, Review) | (Review, Done) => true,
            (a, Failed) => !a.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "indexing" => RunPhase::Indexing,
            "embedding" => RunPhase::Embedding,
            "review" => RunPhase::Review,
            "done" => RunPhase::Done,
            "failed" => RunPhase::Failed,
            other => anyhow::bail!("unknown run phase '{}'", other),
        })
    }
}

/// Lifecycle status of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            other => anyhow::bail!("unknown run status '{}'", other),
        })
    }
}

/// What started a run. Selects the change-detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Import,
    Rescan,
    SanityCheck,
    Push,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Import => "import",
            TriggerKind::Rescan => "rescan",
            TriggerKind::SanityCheck => "sanity_check",
            TriggerKind::Push => "push",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "import" => TriggerKind::Import,
            "rescan" => TriggerKind::Rescan,
            "sanity_check" => TriggerKind::SanityCheck,
            "push" => TriggerKind::Push,
            other => anyhow::bail!("unknown trigger '{}'", other),
        })
    }
}

/// A synchronization attempt.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub id: String,
    pub project_id: String,
    pub trigger: TriggerKind,
    pub phase: RunPhase,
    pub status: RunStatus,
    /// Serialized [`SyncError`](crate::error::SyncError) for failed runs.
    pub error: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

/// Counters attached to a run. Never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub files_total: i64,
    pub files_indexed: i64,
    pub chunks: i64,
    pub review_done: i64,
    pub review_total: i64,
}

/// A lease row.
#[derive(Debug, Clone, Serialize)]
pub struct JobLock {
    pub name: String,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

/// Status of a queued webhook job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "done" => JobStatus::Done,
            "error" => JobStatus::Error,
            other => anyhow::bail!("unknown job status '{}'", other),
        })
    }
}

/// Durable unit of work derived from a webhook delivery.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookJob {
    pub id: String,
    pub event: String,
    pub delivery_id: Option<String>,
    pub payload: String,
    pub status: JobStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    /// A `pending` job is not claimed before this time.
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_parses_common_forms() {
        let expected = RepoRef::new("acme", "docs");
        assert_eq!("acme/docs".parse::<RepoRef>().unwrap(), expected);
        assert_eq!("https://github.com/acme/docs".parse::<RepoRef>().unwrap(), expected);
        assert_eq!("https://github.com/acme/docs.git".parse::<RepoRef>().unwrap(), expected);
        assert_eq!("git@github.com:acme/docs.git".parse::<RepoRef>().unwrap(), expected);
        assert!("acme".parse::<RepoRef>().is_err());
        assert!("a/b/c".parse::<RepoRef>().is_err());
    }

    #[test]
    fn url_normalization_matches_ssh_and_https() {
        assert_eq!(normalize_repo_url("https://github.com/Acme/Docs.git"), "github.com/acme/docs");
        assert_eq!(normalize_repo_url("git@github.com:acme/docs.git"), "github.com/acme/docs");
        assert_eq!(normalize_repo_url("https://github.com/acme/docs/"), "github.com/acme/docs");
    }

    #[test]
    fn phase_order_is_enforced() {
        use RunPhase::*;
        assert!(Indexing.can_advance_to(Embedding));
        assert!(Embedding.can_advance_to(Review));
        assert!(Review.can_advance_to(Done));
        assert!(Indexing.can_advance_to(Failed));
        assert!(Indexing.can_advance_to(Indexing));
        assert!(!Indexing.can_advance_to(Review));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Indexing));
        assert!(!Review.can_advance_to(Embedding));
    }
}
