//! Change detection and per-file reconciliation.
//!
//! Two ways to decide what changed:
//!
//! - **Full tree** ([`plan_full`]): compare the host's recursive listing of
//!   the default branch against the current file rows. Used by import,
//!   rescan and the scheduled sanity check.
//! - **Delta** ([`plan_delta`]): a set of changed and removed paths resolved
//!   from a push (see [`crate::webhook`]).
//!
//! Both produce a [`SyncPlan`]. Executing it is split in two stages so the
//! run can report them as separate phases: [`sync_file`] / [`remove_file`]
//! bring file versions and blobs up to date (indexing), then
//! [`embed_file`] rebuilds the chunk set of each new version (embedding).

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::chunk::chunk_text;
use crate::config::SyncConfig;
use crate::context::AppContext;
use crate::models::{Project, RepoFile};
use crate::storage::blob_key;
use crate::store;
use crate::traits::RepoTree;

// ============ Path filter ============

/// Paths never mirrored regardless of configuration.
const BUILTIN_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/vendor/**",
    "**/target/**",
];

/// Which repository paths are mirrored.
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
    max_file_bytes: u64,
}

impl PathFilter {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes: Vec<String> = BUILTIN_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            include,
            exclude,
            max_file_bytes: config.max_file_bytes,
        })
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        !self.exclude.is_match(path) && self.include.is_match(path)
    }

    pub fn accepts(&self, path: &str, size: u64) -> bool {
        size <= self.max_file_bytes && self.is_tracked(path)
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

// ============ Plans ============

/// Paths changed and removed by a push, after resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDelta {
    pub changed: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl FileDelta {
    pub fn mark_changed(&mut self, path: &str) {
        self.removed.remove(path);
        self.changed.insert(path.to_string());
    }

    pub fn mark_removed(&mut self, path: &str) {
        self.changed.remove(path);
        self.removed.insert(path.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Work a run has to do.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Paths whose content must be fetched and compared.
    pub to_sync: Vec<String>,
    /// Paths whose current version must be retired.
    pub to_remove: Vec<String>,
    /// Current versions with no chunks, to be re-chunked from their stored blob.
    pub to_rechunk: Vec<RepoFile>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_sync.is_empty() && self.to_remove.is_empty() && self.to_rechunk.is_empty()
    }

    /// Files the run will count in `files_total`.
    pub fn total(&self) -> usize {
        self.to_sync.len() + self.to_remove.len() + self.to_rechunk.len()
    }
}

/// Plan a full reconciliation of `tree` against the current rows.
///
/// A truncated listing is never used to infer removals.
pub fn plan_full(
    tree: &RepoTree,
    current: &HashMap<String, RepoFile>,
    missing_chunks: &[RepoFile],
    filter: &PathFilter,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen = BTreeSet::new();

    for entry in &tree.entries {
        if !filter.accepts(&entry.path, entry.size) {
            continue;
        }
        seen.insert(entry.path.as_str());
        match current.get(&entry.path) {
            Some(file) if file.content_hash == entry.sha => {}
            _ => plan.to_sync.push(entry.path.clone()),
        }
    }

    if !tree.truncated {
        plan.to_remove = current
            .keys()
            .filter(|path| !seen.contains(path.as_str()))
            .cloned()
            .collect();
    }

    let syncing: BTreeSet<&str> = plan.to_sync.iter().map(String::as_str).collect();
    plan.to_rechunk = missing_chunks
        .iter()
        .filter(|f| seen.contains(f.path.as_str()) && !syncing.contains(f.path.as_str()))
        .cloned()
        .collect();

    plan.to_sync.sort();
    plan.to_remove.sort();
    plan
}

/// Plan from a resolved push delta, restricted to tracked paths.
pub fn plan_delta(delta: &FileDelta, filter: &PathFilter) -> SyncPlan {
    SyncPlan {
        to_sync: delta
            .changed
            .iter()
            .filter(|p| filter.is_tracked(p))
            .cloned()
            .collect(),
        to_remove: delta
            .removed
            .iter()
            .filter(|p| filter.is_tracked(p))
            .cloned()
            .collect(),
        to_rechunk: Vec::new(),
    }
}

// ============ Per-file work ============

/// A file version whose chunk set must be (re)built.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub file: RepoFile,
    pub text: String,
}

/// Result of reconciling one path.
#[derive(Debug)]
pub enum FileOutcome {
    /// The fetched content matches the current version.
    Unchanged,
    /// A new version was stored and needs chunks.
    Updated(EmbedJob),
    /// The current version was retired.
    Removed,
    /// Nothing to remove: the path had no current version.
    Absent,
}

/// Bring `path` up to date with `git_ref`.
///
/// Content identical to the current version is a no-op, which makes repeated
/// deliveries idempotent. A path the host no longer has, or that grew past
/// `sync.max_file_bytes`, is removed.
pub async fn sync_file(
    ctx: &AppContext,
    project: &Project,
    filter: &PathFilter,
    path: &str,
    git_ref: &str,
) -> Result<FileOutcome> {
    let repo = project.repo_ref();
    let Some(content) = ctx.host.file(&repo, path, git_ref).await? else {
        debug!(project = %repo, path, "path missing on host; removing");
        return remove_file(ctx, project, path).await;
    };

    if content.bytes.len() as u64 > filter.max_file_bytes() {
        debug!(project = %repo, path, size = content.bytes.len(), "file over size limit; removing");
        return remove_file(ctx, project, path).await;
    }

    let current = store::current_file(&ctx.pool, &project.id, path).await?;
    if current.as_ref().is_some_and(|f| f.content_hash == content.sha) {
        return Ok(FileOutcome::Unchanged);
    }

    let key = blob_key(&project.id, &content.sha, path);
    ctx.blobs
        .put(&key, &content.bytes)
        .await
        .with_context(|| format!("failed to store blob {}", key))?;

    let file = store::insert_file_version(
        &ctx.pool,
        &project.id,
        path,
        &content.sha,
        content.bytes.len() as i64,
        &key,
    )
    .await?;
    debug!(project = %repo, path, sha = %content.sha, "stored new file version");

    Ok(FileOutcome::Updated(EmbedJob {
        file,
        text: String::from_utf8_lossy(&content.bytes).into_owned(),
    }))
}

/// Retire the current version of `path` and delete its blob best-effort.
///
/// The blob is kept while another current version still references it.
pub async fn remove_file(ctx: &AppContext, project: &Project, path: &str) -> Result<FileOutcome> {
    let Some(retired) = store::retire_file(&ctx.pool, &project.id, path).await? else {
        return Ok(FileOutcome::Absent);
    };

    match store::blob_in_use(&ctx.pool, &retired.blob_key).await {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = ctx.blobs.delete(&retired.blob_key).await {
                warn!(project = %project.full_name(), path, error = %e, "blob delete failed");
            }
        }
        Err(e) => warn!(project = %project.full_name(), path, error = %e, "blob usage check failed"),
    }
    debug!(project = %project.full_name(), path, "retired file");
    Ok(FileOutcome::Removed)
}

/// Load the stored blob of a current version that lost its chunks.
pub async fn load_for_rechunk(ctx: &AppContext, file: &RepoFile) -> Result<EmbedJob> {
    let bytes = ctx
        .blobs
        .get(&file.blob_key)
        .await
        .with_context(|| format!("failed to read blob {}", file.blob_key))?;
    Ok(EmbedJob {
        file: file.clone(),
        text: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Chunk and embed one file version and store its chunk set. Returns the
/// number of chunks written.
pub async fn embed_file(ctx: &AppContext, job: &EmbedJob) -> Result<usize> {
    let chunking = &ctx.config.chunking;
    let chunks = chunk_text(
        &job.file.path,
        &job.text,
        chunking.window_chars,
        chunking.overlap_chars,
        chunking.max_chunks,
    );

    if !ctx.embedder.is_enabled() || chunks.is_empty() {
        return store::insert_chunks(&ctx.pool, &job.file, &chunks, None, None).await;
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx
        .embedder
        .embed(&texts)
        .await
        .with_context(|| format!("embedding {} chunks of {}", texts.len(), job.file.path))?;
    store::insert_chunks(
        &ctx.pool,
        &job.file,
        &chunks,
        Some(&vectors),
        Some(ctx.embedder.model_name()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TreeEntry;

    fn filter() -> PathFilter {
        PathFilter::from_config(&SyncConfig::default()).unwrap()
    }

    fn entry(path: &str, sha: &str, size: u64) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            sha: sha.to_string(),
            size,
        }
    }

    fn stored(path: &str, sha: &str) -> (String, RepoFile) {
        (
            path.to_string(),
            RepoFile {
                id: format!("id-{}", path),
                project_id: "p".to_string(),
                path: path.to_string(),
                content_hash: sha.to_string(),
                size_bytes: 10,
                blob_key: format!("p/{}/x", sha),
                is_current: true,
                created_at: 0,
            },
        )
    }

    #[test]
    fn filter_applies_globs_and_builtin_excludes() {
        let f = filter();
        assert!(f.is_tracked("README.md"));
        assert!(f.is_tracked("docs/guide/setup.md"));
        assert!(!f.is_tracked("src/main.rs"));
        assert!(!f.is_tracked("node_modules/pkg/README.md"));
        assert!(!f.accepts("docs/huge.md", 2_000_000));
    }

    #[test]
    fn full_plan_diffs_by_hash() {
        let tree = RepoTree {
            sha: "t".to_string(),
            entries: vec![
                entry("README.md", "a1", 10),
                entry("docs/new.md", "b1", 10),
                entry("docs/changed.md", "c2", 10),
                entry("src/lib.rs", "d1", 10),
            ],
            truncated: false,
        };
        let current: HashMap<_, _> = [
            stored("README.md", "a1"),
            stored("docs/changed.md", "c1"),
            stored("docs/gone.md", "e1"),
        ]
        .into_iter()
        .collect();

        let plan = plan_full(&tree, &current, &[], &filter());
        assert_eq!(plan.to_sync, vec!["docs/changed.md", "docs/new.md"]);
        assert_eq!(plan.to_remove, vec!["docs/gone.md"]);
        assert_eq!(plan.total(), 3);
    }

    #[test]
    fn truncated_tree_never_removes() {
        let tree = RepoTree {
            sha: "t".to_string(),
            entries: vec![entry("README.md", "a1", 10)],
            truncated: true,
        };
        let current: HashMap<_, _> = [stored("docs/elsewhere.md", "x")].into_iter().collect();
        let plan = plan_full(&tree, &current, &[], &filter());
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.to_sync, vec!["README.md"]);
    }

    #[test]
    fn unchunked_current_files_are_rechunked() {
        let tree = RepoTree {
            sha: "t".to_string(),
            entries: vec![entry("README.md", "a1", 10)],
            truncated: false,
        };
        let (_, file) = stored("README.md", "a1");
        let current: HashMap<_, _> = [stored("README.md", "a1")].into_iter().collect();
        let plan = plan_full(&tree, &current, &[file], &filter());
        assert!(plan.to_sync.is_empty());
        assert_eq!(plan.to_rechunk.len(), 1);
    }

    #[test]
    fn delta_plan_drops_untracked_paths() {
        let mut delta = FileDelta::default();
        delta.mark_changed("docs/a.md");
        delta.mark_changed("src/lib.rs");
        delta.mark_removed("docs/b.md");
        let plan = plan_delta(&delta, &filter());
        assert_eq!(plan.to_sync, vec!["docs/a.md"]);
        assert_eq!(plan.to_remove, vec!["docs/b.md"]);
    }

    #[test]
    fn delta_last_action_wins() {
        let mut delta = FileDelta::default();
        delta.mark_changed("a.md");
        delta.mark_removed("a.md");
        delta.mark_removed("b.md");
        delta.mark_changed("b.md");
        assert!(delta.changed.contains("b.md") && !delta.removed.contains("b.md"));
        assert!(delta.removed.contains("a.md") && !delta.changed.contains("a.md"));
    }
}
