//! GitHub REST v3 client implementing [`SourceHost`].
//!
//! Every call goes through [`retry_transient`]: rate limits (429, or 403 with
//! `x-ratelimit-remaining: 0`), 5xx responses and network errors are tagged
//! [`ErrorKind::TransientExternal`](crate::error::ErrorKind) and retried with
//! backoff. Other 4xx responses fail immediately; 404 is surfaced as
//! `Ok(None)` where the caller can act on absence.
//!
//! Authenticated with `GITHUB_TOKEN` when set. Unauthenticated calls work for
//! public repositories at a much lower rate limit.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::{GithubConfig, Secrets};
use crate::error::SyncError;
use crate::models::RepoRef;
use crate::retry::{retry_transient, RetryPolicy};
use crate::storage::uri_encode;
use crate::traits::{
    ChangeStatus, ChangedFile, CommitInfo, FileContent, HookInfo, RepoInfo, RepoTree, SourceHost,
    TreeEntry,
};

#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
    owner: OwnerResponse,
    html_url: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    sha: String,
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    files: Vec<CompareFile>,
}

#[derive(Debug, Deserialize)]
struct CompareFile {
    filename: String,
    status: String,
    #[serde(default)]
    previous_filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitListItem {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    #[serde(default)]
    author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
    #[serde(default)]
    config: HookConfigResponse,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfigResponse {
    #[serde(default)]
    url: Option<String>,
}

impl From<HookResponse> for HookInfo {
    fn from(h: HookResponse) -> Self {
        HookInfo {
            id: h.id,
            url: h.config.url.unwrap_or_default(),
            events: h.events,
            active: h.active,
        }
    }
}

impl GitHubClient {
    pub fn new(config: &GithubConfig, secrets: &Secrets) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("doc-mirror/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: secrets.github_token.clone(),
            policy: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.retry_base_millis),
            ),
        })
    }

    fn repo_url(&self, repo: &RepoRef) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url,
            uri_encode(&repo.owner),
            uri_encode(&repo.name)
        )
    }

    /// One attempt. `Ok(None)` on 404.
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<reqwest::Response>> {
        let mut req = self
            .client
            .request(method.clone(), url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SyncError::transient("github", format!("{} {}: {}", method, url, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let rate_limited = status == StatusCode::FORBIDDEN
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0");
        let error_text = response.text().await.unwrap_or_default();
        let snippet: String = error_text.chars().take(300).collect();
        let message = format!("GitHub API error {} for {} {}: {}", status, method, url, snippet);

        if rate_limited || status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SyncError::transient("github", message).into());
        }
        Err(anyhow!(message))
    }

    /// Retried request returning parsed JSON, or `None` on 404.
    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>> {
        let label = format!("github {}", method);
        let body = body.as_ref();
        let method = &method;
        retry_transient(&self.policy, &label, move || async move {
            match self.send_once(method.clone(), url, body).await? {
                Some(resp) => {
                    let parsed = resp
                        .json::<T>()
                        .await
                        .with_context(|| format!("Failed to parse response from {}", url))?;
                    Ok::<_, anyhow::Error>(Some(parsed))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        self.request_json(Method::GET, url, None).await
    }

    async fn fetch_blob(&self, repo: &RepoRef, sha: &str) -> Result<Vec<u8>> {
        let url = format!("{}/git/blobs/{}", self.repo_url(repo), sha);
        let blob: BlobResponse = self
            .get_json(&url)
            .await?
            .ok_or_else(|| anyhow!("blob {} not found in {}", sha, repo))?;
        if blob.encoding != "base64" {
            bail!("unsupported blob encoding '{}'", blob.encoding);
        }
        decode_base64(&blob.content)
    }
}

fn decode_base64(content: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(content.replace('\n', ""))
        .context("Failed to decode base64 file content")
}

fn encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Map one compare entry onto the change model. `unchanged` entries are dropped.
fn map_compare_file(f: CompareFile) -> Option<ChangedFile> {
    let status = match f.status.as_str() {
        "added" | "copied" => ChangeStatus::Added,
        "modified" | "changed" => ChangeStatus::Modified,
        "removed" => ChangeStatus::Removed,
        "renamed" => ChangeStatus::Renamed,
        _ => return None,
    };
    Some(ChangedFile {
        path: f.filename,
        status,
        previous_path: f.previous_filename,
    })
}

#[async_trait]
impl SourceHost for GitHubClient {
    async fn repository(&self, repo: &RepoRef) -> Result<RepoInfo> {
        let r: RepoResponse = self
            .get_json(&self.repo_url(repo))
            .await?
            .ok_or_else(|| anyhow!("repository {} not found or not accessible", repo))?;
        Ok(RepoInfo {
            owner: r.owner.login,
            name: r.name,
            html_url: r.html_url,
            default_branch: r.default_branch,
        })
    }

    async fn tree(&self, repo: &RepoRef, git_ref: &str) -> Result<RepoTree> {
        let url = format!(
            "{}/git/trees/{}?recursive=1",
            self.repo_url(repo),
            encode_path(git_ref)
        );
        let t: TreeResponse = self
            .get_json(&url)
            .await?
            .ok_or_else(|| anyhow!("tree {} not found in {}", git_ref, repo))?;

        let entries = t
            .tree
            .into_iter()
            .filter(|item| item.kind == "blob")
            .map(|item| TreeEntry {
                path: item.path,
                sha: item.sha,
                size: item.size.unwrap_or(0),
            })
            .collect::<Vec<_>>();
        debug!(repo = %repo, entries = entries.len(), truncated = t.truncated, "fetched tree");

        Ok(RepoTree {
            sha: t.sha,
            entries,
            truncated: t.truncated,
        })
    }

    async fn file(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<Option<FileContent>> {
        let url = format!(
            "{}/contents/{}?ref={}",
            self.repo_url(repo),
            encode_path(path),
            uri_encode(git_ref)
        );
        let value: Option<serde_json::Value> = self.get_json(&url).await?;
        let Some(value) = value else {
            return Ok(None);
        };
        if value.is_array() {
            bail!("'{}' is a directory, not a file", path);
        }
        let c: ContentsResponse =
            serde_json::from_value(value).context("Failed to parse file contents response")?;
        if c.kind != "file" {
            bail!("'{}' is a {}, not a file", path, c.kind);
        }

        // Files above 1 MB come back without inline content.
        let bytes = match (c.content.as_deref(), c.encoding.as_deref()) {
            (Some(content), Some("base64")) if !content.is_empty() => decode_base64(content)?,
            _ => self.fetch_blob(repo, &c.sha).await?,
        };

        Ok(Some(FileContent {
            path: path.to_string(),
            sha: c.sha,
            bytes,
        }))
    }

    async fn compare(&self, repo: &RepoRef, base: &str, head: &str) -> Result<Vec<ChangedFile>> {
        let url = format!(
            "{}/compare/{}...{}",
            self.repo_url(repo),
            uri_encode(base),
            uri_encode(head)
        );
        let c: CompareResponse = self
            .get_json(&url)
            .await?
            .ok_or_else(|| anyhow!("compare {}...{} not found in {}", base, head, repo))?;
        Ok(c.files.into_iter().filter_map(map_compare_file).collect())
    }

    async fn commits(&self, repo: &RepoRef, branch: &str, limit: usize) -> Result<Vec<CommitInfo>> {
        let url = format!(
            "{}/commits?sha={}&per_page={}",
            self.repo_url(repo),
            uri_encode(branch),
            limit.clamp(1, 100)
        );
        let items: Vec<CommitListItem> = self.get_json(&url).await?.unwrap_or_default();
        Ok(items
            .into_iter()
            .map(|item| {
                let (author, committed_at) = match item.commit.author {
                    Some(a) => (a.name, a.date),
                    None => (None, None),
                };
                CommitInfo {
                    sha: item.sha,
                    message: item.commit.message,
                    author,
                    committed_at,
                }
            })
            .collect())
    }

    async fn create_hook(&self, repo: &RepoRef, url: &str, secret: &str) -> Result<HookInfo> {
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push"],
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            }
        });
        let hook: HookResponse = self
            .request_json(Method::POST, &format!("{}/hooks", self.repo_url(repo)), Some(body))
            .await?
            .ok_or_else(|| anyhow!("repository {} not found or hooks not permitted", repo))?;
        Ok(hook.into())
    }

    async fn list_hooks(&self, repo: &RepoRef) -> Result<Vec<HookInfo>> {
        let hooks: Vec<HookResponse> = self
            .get_json(&format!("{}/hooks?per_page=100", self.repo_url(repo)))
            .await?
            .unwrap_or_default();
        Ok(hooks.into_iter().map(HookInfo::from).collect())
    }

    async fn delete_hook(&self, repo: &RepoRef, hook_id: u64) -> Result<()> {
        let url = format!("{}/hooks/{}", self.repo_url(repo), hook_id);
        let method = Method::DELETE;
        let method = &method;
        let url = url.as_str();
        retry_transient(&self.policy, "github DELETE", move || async move {
            self.send_once(method.clone(), url, None).await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_statuses_map_onto_changes() {
        let renamed = map_compare_file(CompareFile {
            filename: "docs/new.md".into(),
            status: "renamed".into(),
            previous_filename: Some("docs/old.md".into()),
        })
        .unwrap();
        assert_eq!(renamed.status, ChangeStatus::Renamed);
        assert_eq!(renamed.previous_path.as_deref(), Some("docs/old.md"));

        let unchanged = map_compare_file(CompareFile {
            filename: "a.md".into(),
            status: "unchanged".into(),
            previous_filename: None,
        });
        assert!(unchanged.is_none());
    }

    #[test]
    fn base64_with_line_breaks_decodes() {
        let encoded = "aGVsbG8g\nd29ybGQ=\n";
        assert_eq!(decode_base64(encoded).unwrap(), b"hello world");
    }

    #[test]
    fn paths_are_encoded_per_segment() {
        assert_eq!(encode_path("docs/my file.md"), "docs/my%20file.md");
    }

    #[test]
    fn tree_response_tolerates_missing_sizes() {
        let json = serde_json::json!({
            "sha": "t1",
            "tree": [
                {"path": "docs", "type": "tree", "sha": "d1"},
                {"path": "docs/a.md", "type": "blob", "sha": "b1", "size": 12}
            ]
        });
        let t: TreeResponse = serde_json::from_value(json).unwrap();
        assert!(!t.truncated);
        assert_eq!(t.tree.len(), 2);
        assert_eq!(t.tree[0].size, None);
    }
}
