//! GitHub push webhooks: signature check, payload model, delta resolution,
//! push processing and hook installation.
//!
//! [`process_push`] is shared by the inline HTTP path and the queue worker,
//! so a delivery behaves the same however it reaches the pipeline.
//!
//! # Delta resolution
//!
//! The changed file set of a push comes from the compare API
//! (`before...after`). When `before` is the zero SHA (new branch) or the
//! compare call fails, the per-commit `added`/`modified`/`removed` lists of
//! the payload are unioned instead, oldest commit first, so the last action
//! on a path wins.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::ingest::{run_sync, SyncOptions, SyncReport};
use crate::models::{Project, RepoRef};
use crate::progress::SyncProgressReporter;
use crate::reconcile::FileDelta;
use crate::store;
use crate::traits::{ChangeStatus, ChangedFile, CommitInfo, HookInfo};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Path the server accepts deliveries on.
pub const WEBHOOK_PATH: &str = "/webhooks/github";

// ============ Signature ============

/// Check `X-Hub-Signature-256: sha256=<hex>` against the raw body.
///
/// The comparison is constant-time. A missing or malformed header fails.
pub fn verify_github_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// The header value GitHub would send for `body`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ============ Payload ============

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    pub repository: PushRepository,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub clone_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: Option<PushAuthor>,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushAuthor {
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl PushEvent {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).context("invalid push payload")
    }

    /// Branch name for `refs/heads/*` refs.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    pub fn is_branch_deletion(&self) -> bool {
        self.deleted || is_zero_sha(&self.after)
    }
}

impl From<&PushCommit> for CommitInfo {
    fn from(c: &PushCommit) -> Self {
        CommitInfo {
            sha: c.id.clone(),
            message: c.message.clone(),
            author: c
                .author
                .as_ref()
                .map(|a| a.username.clone().unwrap_or_else(|| a.name.clone())),
            committed_at: c.timestamp.clone(),
        }
    }
}

pub fn is_zero_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.bytes().all(|b| b == b'0')
}

// ============ Delta ============

/// Union the per-commit file lists, oldest commit first.
pub fn union_commit_changes(commits: &[PushCommit]) -> FileDelta {
    let mut delta = FileDelta::default();
    for commit in commits {
        for path in commit.added.iter().chain(commit.modified.iter()) {
            delta.mark_changed(path);
        }
        for path in &commit.removed {
            delta.mark_removed(path);
        }
    }
    delta
}

/// Convert a compare file list. A rename removes the old path and changes the new one.
pub fn delta_from_compare(files: &[ChangedFile]) -> FileDelta {
    let mut delta = FileDelta::default();
    for file in files {
        match file.status {
            ChangeStatus::Added | ChangeStatus::Modified => delta.mark_changed(&file.path),
            ChangeStatus::Removed => delta.mark_removed(&file.path),
            ChangeStatus::Renamed => {
                if let Some(prev) = &file.previous_path {
                    delta.mark_removed(prev);
                }
                delta.mark_changed(&file.path);
            }
        }
    }
    delta
}

/// Changed and removed paths of `push`.
pub async fn resolve_delta(ctx: &AppContext, project: &Project, push: &PushEvent) -> FileDelta {
    if is_zero_sha(&push.before) {
        return union_commit_changes(&push.commits);
    }
    match ctx
        .host
        .compare(&project.repo_ref(), &push.before, &push.after)
        .await
    {
        Ok(files) => delta_from_compare(&files),
        Err(e) => {
            warn!(
                project = %project.full_name(),
                error = %format!("{:#}", e),
                "compare failed; using commit file lists"
            );
            union_commit_changes(&push.commits)
        }
    }
}

// ============ Processing ============

/// What became of a push delivery.
#[derive(Debug)]
pub enum PushOutcome {
    Ignored(&'static str),
    Synced(SyncReport),
}

/// Process one push: record its commits and reconcile the changed files.
pub async fn process_push(
    ctx: &AppContext,
    push: &PushEvent,
    reporter: Arc<dyn SyncProgressReporter>,
) -> Result<PushOutcome> {
    if push.is_branch_deletion() {
        debug!(git_ref = %push.git_ref, "branch deletion ignored");
        return Ok(PushOutcome::Ignored("branch_deleted"));
    }

    let Some(project) = find_push_project(ctx, &push.repository).await? else {
        info!(repository = %push.repository.full_name, "push for untracked repository ignored");
        return Ok(PushOutcome::Ignored("unknown_repository"));
    };

    if push.branch() != Some(project.default_branch.as_str()) {
        debug!(project = %project.full_name(), git_ref = %push.git_ref, "push to non-default branch ignored");
        return Ok(PushOutcome::Ignored("non_default_branch"));
    }

    let mut new_commits = 0;
    for commit in &push.commits {
        if store::upsert_commit(&ctx.pool, &project.id, &CommitInfo::from(commit)).await? {
            new_commits += 1;
        }
    }

    let delta = resolve_delta(ctx, &project, push).await;
    info!(
        project = %project.full_name(),
        after = %push.after,
        new_commits,
        changed = delta.changed.len(),
        removed = delta.removed.len(),
        "processing push"
    );
    if delta.is_empty() {
        return Ok(PushOutcome::Ignored("no_changes"));
    }

    let report = run_sync(ctx, &project, SyncOptions::push(delta, &push.after), reporter).await?;
    Ok(PushOutcome::Synced(report))
}

async fn find_push_project(ctx: &AppContext, repo: &PushRepository) -> Result<Option<Project>> {
    if let Some(p) = store::find_project_by_url(&ctx.pool, &repo.html_url).await? {
        return Ok(Some(p));
    }
    if let Some(url) = &repo.clone_url {
        if let Some(p) = store::find_project_by_url(&ctx.pool, url).await? {
            return Ok(Some(p));
        }
    }
    match repo.full_name.parse::<RepoRef>() {
        Ok(r) => store::find_project(&ctx.pool, &r).await,
        Err(_) => Ok(None),
    }
}

// ============ Installation ============

/// Delivery URL derived from `server.public_url`.
pub fn hook_url(ctx: &AppContext) -> Result<String> {
    let Some(base) = &ctx.config.server.public_url else {
        bail!("server.public_url must be set to install webhooks");
    };
    Ok(format!("{}{}", base.trim_end_matches('/'), WEBHOOK_PATH))
}

/// Register the push webhook on `repo`. An existing hook with the same URL
/// is returned instead of creating a duplicate.
pub async fn install_hook(ctx: &AppContext, repo: &RepoRef) -> Result<HookInfo> {
    let url = hook_url(ctx)?;
    let Some(secret) = &ctx.secrets.webhook_secret else {
        bail!("GITHUB_WEBHOOK_SECRET must be set to install webhooks");
    };
    if let Some(existing) = ctx
        .host
        .list_hooks(repo)
        .await?
        .into_iter()
        .find(|h| h.url == url)
    {
        info!(repository = %repo, hook_id = existing.id, "webhook already installed");
        return Ok(existing);
    }
    let hook = ctx.host.create_hook(repo, &url, secret).await?;
    info!(repository = %repo, hook_id = hook.id, url = %url, "webhook installed");
    Ok(hook)
}

pub async fn list_hooks(ctx: &AppContext, repo: &RepoRef) -> Result<Vec<HookInfo>> {
    ctx.host.list_hooks(repo).await
}

/// Delete every hook on `repo` pointing at our delivery URL. Returns how many.
pub async fn remove_hook(ctx: &AppContext, repo: &RepoRef) -> Result<usize> {
    let url = hook_url(ctx)?;
    let mut removed = 0;
    for hook in ctx.host.list_hooks(repo).await? {
        if hook.url == url {
            ctx.host.delete_hook(repo, hook.id).await?;
            removed += 1;
        }
    }
    info!(repository = %repo, removed, "webhooks removed");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "ref": "refs/heads/main",
        "before": "1111111111111111111111111111111111111111",
        "after": "2222222222222222222222222222222222222222",
        "repository": {
            "name": "docs",
            "full_name": "acme/docs",
            "html_url": "https://github.com/acme/docs",
            "clone_url": "https://github.com/acme/docs.git"
        },
        "commits": [
            {"id": "a1", "message": "add guide", "author": {"name": "Ada", "username": "ada"},
             "added": ["docs/guide.md"], "modified": [], "removed": ["docs/old.md"]},
            {"id": "b2", "message": "restore", "author": {"name": "Bob"},
             "added": ["docs/old.md"], "modified": ["README.md"], "removed": ["docs/guide.md"]}
        ]
    }"#;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"zen":"hello"}"#;
        let header = sign_payload("s3cret", body);
        assert!(verify_github_signature("s3cret", body, Some(&header)));
    }

    #[test]
    fn signature_rejects_mismatch_and_garbage() {
        let body = br#"{"zen":"hello"}"#;
        let header = sign_payload("s3cret", body);
        assert!(!verify_github_signature("other", body, Some(&header)));
        assert!(!verify_github_signature("s3cret", b"{}", Some(&header)));
        assert!(!verify_github_signature("s3cret", body, None));
        assert!(!verify_github_signature("s3cret", body, Some("sha1=abc")));
        assert!(!verify_github_signature("s3cret", body, Some("sha256=not-hex")));
        assert!(!verify_github_signature("s3cret", body, Some("sha256=abcd")));
    }

    #[test]
    fn parses_push_payload() {
        let push = PushEvent::parse(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(push.branch(), Some("main"));
        assert!(!push.is_branch_deletion());
        assert_eq!(push.commits.len(), 2);
        let info = CommitInfo::from(&push.commits[0]);
        assert_eq!(info.author.as_deref(), Some("ada"));
        assert_eq!(CommitInfo::from(&push.commits[1]).author.as_deref(), Some("Bob"));
    }

    #[test]
    fn union_applies_commits_in_order() {
        let push = PushEvent::parse(PAYLOAD.as_bytes()).unwrap();
        let delta = union_commit_changes(&push.commits);
        let changed: Vec<&str> = delta.changed.iter().map(String::as_str).collect();
        let removed: Vec<&str> = delta.removed.iter().map(String::as_str).collect();
        assert_eq!(changed, vec!["README.md", "docs/old.md"]);
        assert_eq!(removed, vec!["docs/guide.md"]);
    }

    #[test]
    fn compare_renames_split_into_remove_and_change() {
        let files = vec![
            ChangedFile {
                path: "docs/new-name.md".to_string(),
                status: ChangeStatus::Renamed,
                previous_path: Some("docs/old-name.md".to_string()),
            },
            ChangedFile {
                path: "docs/gone.md".to_string(),
                status: ChangeStatus::Removed,
                previous_path: None,
            },
        ];
        let delta = delta_from_compare(&files);
        assert!(delta.changed.contains("docs/new-name.md"));
        assert!(delta.removed.contains("docs/old-name.md"));
        assert!(delta.removed.contains("docs/gone.md"));
    }

    #[test]
    fn zero_sha_detection() {
        assert!(is_zero_sha("0000000000000000000000000000000000000000"));
        assert!(!is_zero_sha("0000000000000000000000000000000000000001"));
        assert!(!is_zero_sha(""));
    }
}
