//! Tagged error taxonomy for the synchronization pipeline.
//!
//! Every failure the pipeline reports to a caller is a [`SyncError`]: an
//! [`ErrorKind`] tag, a human-readable message, and a flat context map
//! (`phase`, `path`, `run_id`, ...) that is safe to show to operators.
//!
//! Internally the crate propagates `anyhow::Error`. A `SyncError` travels
//! inside it unchanged and is recovered with [`SyncError::find`], which is how
//! the retrier decides whether an error is worth another attempt.
//!
//! | Kind | Meaning |
//! |------|---------|
//! | `transient_external` | network / rate-limit / 5xx from the source host or embedding API |
//! | `lock_contention` | exclusive execution rights could not be obtained |
//! | `partial_file_failure` | one file failed; siblings and the run continue |
//! | `run_failure` | the whole run was marked failed |
//! | `queue_exhausted` | a webhook job used up its retries |

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Category of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientExternal,
    LockContention,
    PartialFileFailure,
    RunFailure,
    QueueExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::PartialFileFailure => "partial_file_failure",
            ErrorKind::RunFailure => "run_failure",
            ErrorKind::QueueExhausted => "queue_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline error with structured context.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context entry. Later values for the same key win.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    pub fn transient(service: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientExternal, message).with("service", service)
    }

    pub fn lock_contention(lock: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LockContention, message).with("lock", lock)
    }

    /// Wrap an arbitrary error as a failure of a single file.
    pub fn file_failure(path: &str, err: &anyhow::Error) -> Self {
        let mut out = Self::new(ErrorKind::PartialFileFailure, format!("{:#}", err)).with("path", path);
        if let Some(inner) = SyncError::find(err) {
            for (k, v) in &inner.context {
                out.context.entry(k.clone()).or_insert_with(|| v.clone());
            }
            out = out.with("cause", inner.kind);
        }
        out
    }

    /// Wrap an arbitrary error as the failure of a whole run.
    pub fn run_failure(run_id: &str, phase: &str, err: &anyhow::Error) -> Self {
        let mut out = Self::new(ErrorKind::RunFailure, format!("{:#}", err))
            .with("run_id", run_id)
            .with("phase", phase);
        if let Some(inner) = SyncError::find(err) {
            for (k, v) in &inner.context {
                out.context.entry(k.clone()).or_insert_with(|| v.clone());
            }
            out = out.with("cause", inner.kind);
        }
        out
    }

    /// Find a `SyncError` anywhere in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&SyncError> {
        err.chain().find_map(|e| e.downcast_ref::<SyncError>())
    }

    pub fn is_transient(err: &anyhow::Error) -> bool {
        matches!(
            SyncError::find(err).map(|e| e.kind),
            Some(ErrorKind::TransientExternal)
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn transient_is_found_through_context_layers() {
        let err: anyhow::Result<()> = Err(SyncError::transient("embedding", "HTTP 429").into());
        let err = err.context("embedding batch").unwrap_err();
        assert!(SyncError::is_transient(&err));
    }

    #[test]
    fn plain_errors_are_not_transient() {
        let err = anyhow::anyhow!("HTTP 401 unauthorized");
        assert!(!SyncError::is_transient(&err));
    }

    #[test]
    fn file_failure_inherits_inner_context() {
        let inner: anyhow::Error = SyncError::transient("github", "timeout").into();
        let wrapped = SyncError::file_failure("docs/a.md", &inner);
        assert_eq!(wrapped.kind, ErrorKind::PartialFileFailure);
        assert_eq!(wrapped.context["path"], "docs/a.md");
        assert_eq!(wrapped.context["service"], "github");
        assert_eq!(wrapped.context["cause"], "transient_external");
    }

    #[test]
    fn serializes_kind_as_snake_case() {
        let e = SyncError::new(ErrorKind::QueueExhausted, "gave up").with("job_id", "j1");
        let json: serde_json::Value = serde_json::from_str(&e.to_json()).unwrap();
        assert_eq!(json["kind"], "queue_exhausted");
        assert_eq!(json["context"]["job_id"], "j1");
    }
}
