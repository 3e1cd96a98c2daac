//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tempfile::TempDir;

use doc_mirror::config::{parse_config, Secrets};
use doc_mirror::context::AppContext;
use doc_mirror::db;
use doc_mirror::error::SyncError;
use doc_mirror::migrate::migrate_pool;
use doc_mirror::models::RepoRef;
use doc_mirror::storage::FsBlobStore;
use doc_mirror::traits::{
    Analyzer, ChangedFile, CommitInfo, Embedder, FileContent, HookInfo, RepoInfo, RepoTree,
    SourceHost, TreeEntry,
};

pub const OWNER: &str = "acme";
pub const REPO: &str = "handbook";
pub const HTML_URL: &str = "https://github.com/acme/handbook";

// ─── Source host ────────────────────────────────────────────────────

/// A single repository whose files live in a map keyed by path.
#[derive(Default)]
pub struct FakeHost {
    files: Mutex<BTreeMap<String, (String, String)>>,
    compare: Mutex<Option<Vec<ChangedFile>>>,
    commits: Mutex<Vec<CommitInfo>>,
    hooks: Mutex<Vec<HookInfo>>,
    next_hook: AtomicU64,
    pub file_fetches: AtomicUsize,
}

pub fn git_sha(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())[..40].to_string()
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, text: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (git_sha(text), text.to_string()));
    }

    pub fn delete(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn set_compare(&self, files: Vec<ChangedFile>) {
        *self.compare.lock().unwrap() = Some(files);
    }

    pub fn set_commits(&self, commits: Vec<CommitInfo>) {
        *self.commits.lock().unwrap() = commits;
    }
}

#[async_trait]
impl SourceHost for FakeHost {
    async fn repository(&self, repo: &RepoRef) -> Result<RepoInfo> {
        if repo.owner != OWNER || repo.name != REPO {
            bail!("repository {} not found", repo);
        }
        Ok(RepoInfo {
            owner: OWNER.to_string(),
            name: REPO.to_string(),
            html_url: HTML_URL.to_string(),
            default_branch: "main".to_string(),
        })
    }

    async fn tree(&self, _repo: &RepoRef, _git_ref: &str) -> Result<RepoTree> {
        let entries = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, (sha, text))| TreeEntry {
                path: path.clone(),
                sha: sha.clone(),
                size: text.len() as u64,
            })
            .collect();
        Ok(RepoTree {
            sha: "tree".to_string(),
            entries,
            truncated: false,
        })
    }

    async fn file(&self, _repo: &RepoRef, path: &str, _git_ref: &str) -> Result<Option<FileContent>> {
        self.file_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|(sha, text)| FileContent {
                path: path.to_string(),
                sha: sha.clone(),
                bytes: text.as_bytes().to_vec(),
            }))
    }

    async fn compare(&self, _repo: &RepoRef, _base: &str, _head: &str) -> Result<Vec<ChangedFile>> {
        match self.compare.lock().unwrap().clone() {
            Some(files) => Ok(files),
            None => Err(SyncError::transient("github", "compare unavailable").into()),
        }
    }

    async fn commits(&self, _repo: &RepoRef, _branch: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        Ok(self.commits.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn create_hook(&self, _repo: &RepoRef, url: &str, _secret: &str) -> Result<HookInfo> {
        let hook = HookInfo {
            id: self.next_hook.fetch_add(1, Ordering::SeqCst) + 1,
            url: url.to_string(),
            events: vec!["push".to_string()],
            active: true,
        };
        self.hooks.lock().unwrap().push(hook.clone());
        Ok(hook)
    }

    async fn list_hooks(&self, _repo: &RepoRef) -> Result<Vec<HookInfo>> {
        Ok(self.hooks.lock().unwrap().clone())
    }

    async fn delete_hook(&self, _repo: &RepoRef, hook_id: u64) -> Result<()> {
        self.hooks.lock().unwrap().retain(|h| h.id != hook_id);
        Ok(())
    }
}

// ─── Embedder ───────────────────────────────────────────────────────

/// Fails the first `failures` calls with a transient error, then returns
/// fixed-size vectors.
pub struct FlakyEmbedder {
    failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "fake-embed"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(SyncError::transient("embedding", "HTTP 429").into());
        }
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
    }
}

// ─── Analyzer ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAnalyzer {
    pub reasons: Mutex<Vec<String>>,
}

#[async_trait]
impl Analyzer for RecordingAnalyzer {
    async fn regenerate(&self, _project_id: &str, _repo: &RepoRef, reason: &str) -> Result<()> {
        self.reasons.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

// ─── Context ────────────────────────────────────────────────────────

pub struct Harness {
    pub _dir: TempDir,
    pub ctx: AppContext,
    pub host: Arc<FakeHost>,
    pub embedder: Arc<FlakyEmbedder>,
    pub analyzer: Arc<RecordingAnalyzer>,
}

impl Harness {
    pub fn pool(&self) -> &SqlitePool {
        &self.ctx.pool
    }

    pub fn repo(&self) -> RepoRef {
        RepoRef::new(OWNER, REPO)
    }
}

pub const WEBHOOK_SECRET: &str = "hook-secret";
pub const CRON_SECRET: &str = "cron-secret";

/// Context over a temp database and blob directory.
///
/// Small chunk windows keep chunk counts easy to reason about.
pub async fn harness(extra_toml: &str, embed_failures: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"[db]
path = {db:?}

[chunking]
window_chars = 100
overlap_chars = 20

[embedding]
provider = "openai"
model = "fake-embed"
retry_base_millis = 1

[storage]
root = {blobs:?}

[sync]
lock_retry_millis = 1

{extra}
"#,
        db = dir.path().join("mirror.sqlite"),
        blobs = dir.path().join("blobs"),
        extra = extra_toml,
    );
    let config = parse_config(&toml).unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();

    let secrets = Secrets {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        cron_secret: Some(CRON_SECRET.to_string()),
        ..Default::default()
    };

    let host = Arc::new(FakeHost::new());
    let embedder = Arc::new(FlakyEmbedder::new(embed_failures));
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));

    let ctx = AppContext::from_parts(
        pool,
        config,
        secrets,
        host.clone(),
        blobs,
        embedder.clone(),
        analyzer.clone(),
    );
    Harness {
        _dir: dir,
        ctx,
        host,
        embedder,
        analyzer,
    }
}

/// `len` characters of filler text tagged with `seed`.
pub fn doc(seed: &str, len: usize) -> String {
    let mut text = format!("# {}\n", seed);
    while text.len() < len {
        text.push_str("lorem ipsum ");
    }
    text.truncate(len);
    text
}
