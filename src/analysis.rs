//! AI analysis regeneration.
//!
//! The analysis itself is produced by an external service; this module only
//! decides *when* to ask for a new one and makes the call.
//!
//! Regeneration is requested when a push touched one of the configured
//! `analysis.core_paths`, or when the last analysis is older than
//! `analysis.stale_after_hours` and anything changed at all.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{AnalysisConfig, Secrets};
use crate::context::AppContext;
use crate::db::now_ts;
use crate::error::SyncError;
use crate::models::{Project, RepoRef};
use crate::store;
use crate::traits::Analyzer;

pub const REASON_CORE_DOCS: &str = "core_docs_changed";
pub const REASON_STALE: &str = "stale";

pub fn create_analyzer(config: &AnalysisConfig, secrets: &Secrets) -> Result<Arc<dyn Analyzer>> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpAnalyzer::new(endpoint, config, secrets)?)),
        None => Ok(Arc::new(DisabledAnalyzer)),
    }
}

/// Decide whether a change set warrants a new analysis.
///
/// Returns the reason tag, or `None` to skip. `last_generated_at` of `None`
/// means no analysis exists yet and counts as stale.
pub fn regeneration_reason<'a>(
    changed_paths: impl IntoIterator<Item = &'a String>,
    core_paths: &[String],
    last_generated_at: Option<i64>,
    now: i64,
    stale_after_hours: i64,
) -> Option<&'static str> {
    let mut any_change = false;
    for path in changed_paths {
        any_change = true;
        if core_paths.iter().any(|core| core.eq_ignore_ascii_case(path)) {
            return Some(REASON_CORE_DOCS);
        }
    }
    if !any_change {
        return None;
    }
    match last_generated_at {
        Some(ts) if now - ts <= stale_after_hours * 3600 => None,
        _ => Some(REASON_STALE),
    }
}

/// Regenerate and record the analysis of `project`.
pub async fn regenerate(ctx: &AppContext, project: &Project, reason: &str) -> Result<()> {
    if !ctx.analyzer.is_enabled() {
        return Ok(());
    }
    ctx.analyzer
        .regenerate(&project.id, &project.repo_ref(), reason)
        .await?;
    store::record_analysis(&ctx.pool, &project.id, reason).await?;
    info!(project = %project.full_name(), reason, "analysis regenerated");
    Ok(())
}

/// Regenerate in a detached task that logs its own failure.
pub fn spawn_regeneration(ctx: &AppContext, project: &Project, reason: &'static str) {
    if !ctx.analyzer.is_enabled() {
        return;
    }
    let ctx = ctx.clone();
    let project = project.clone();
    tokio::spawn(async move {
        if let Err(e) = regenerate(&ctx, &project, reason).await {
            warn!(project = %project.full_name(), reason, error = %format!("{:#}", e), "analysis regeneration failed");
        }
    });
}

/// Apply the regeneration policy to a push's changed paths and spawn if needed.
pub async fn maybe_regenerate_after_push<'a>(
    ctx: &AppContext,
    project: &Project,
    changed_paths: impl IntoIterator<Item = &'a String>,
) -> Result<Option<&'static str>> {
    if !ctx.analyzer.is_enabled() {
        return Ok(None);
    }
    let last = store::last_analysis_at(&ctx.pool, &project.id).await?;
    let reason = regeneration_reason(
        changed_paths,
        &ctx.config.analysis.core_paths,
        last,
        now_ts(),
        ctx.config.analysis.stale_after_hours,
    );
    if let Some(reason) = reason {
        spawn_regeneration(ctx, project, reason);
    }
    Ok(reason)
}

// ============ Backends ============

/// Used when no `analysis.endpoint` is configured.
pub struct DisabledAnalyzer;

#[async_trait]
impl Analyzer for DisabledAnalyzer {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn regenerate(&self, _project_id: &str, _repo: &RepoRef, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// `POST {endpoint}` with `{project_id, repository, reason}`, authenticated
/// with `ANALYSIS_TOKEN` when set.
pub struct HttpAnalyzer {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, config: &AnalysisConfig, secrets: &Secrets) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            token: secrets.analysis_token.clone(),
            client,
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn regenerate(&self, project_id: &str, repo: &RepoRef, reason: &str) -> Result<()> {
        let body = serde_json::json!({
            "project_id": project_id,
            "repository": repo.to_string(),
            "reason": reason,
        });
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::transient("analysis", format!("request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(300).collect();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(SyncError::transient("analysis", format!("HTTP {}: {}", status, snippet)).into());
        }
        bail!("analysis service error {}: {}", status, snippet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Vec<String> {
        vec!["README.md".to_string(), "docs/index.md".to_string()]
    }

    #[test]
    fn core_path_change_always_regenerates() {
        let changed = vec!["readme.md".to_string()];
        assert_eq!(
            regeneration_reason(&changed, &core(), Some(1000), 1000, 24),
            Some(REASON_CORE_DOCS)
        );
    }

    #[test]
    fn fresh_analysis_skips_ordinary_changes() {
        let changed = vec!["docs/guide.md".to_string()];
        assert_eq!(regeneration_reason(&changed, &core(), Some(1000), 1000 + 3600, 24), None);
    }

    #[test]
    fn stale_or_missing_analysis_regenerates_on_any_change() {
        let changed = vec!["docs/guide.md".to_string()];
        let day = 24 * 3600;
        assert_eq!(
            regeneration_reason(&changed, &core(), Some(0), day + 1, 24),
            Some(REASON_STALE)
        );
        assert_eq!(regeneration_reason(&changed, &core(), None, 0, 24), Some(REASON_STALE));
    }

    #[test]
    fn no_changes_never_regenerates() {
        let changed: Vec<String> = Vec::new();
        assert_eq!(regeneration_reason(&changed, &core(), None, 0, 24), None);
    }
}
