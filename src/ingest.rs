//! Ingestion pipeline orchestration.
//!
//! Coordinates one synchronization of a project:
//!
//! ```text
//! claim lock → start run → plan → indexing → embedding → review → done
//!                                      (any error) ─────────────▶ failed
//! release lock (always)
//! ```
//!
//! Files are processed in batches of `sync.concurrency` with `join_all`. A
//! file that fails is recorded as a `PartialFileFailure` in the
//! [`SyncReport`]; its siblings and the run carry on. Only an error outside
//! per-file work (tree listing, lock table, database) fails the run.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis;
use crate::context::AppContext;
use crate::error::SyncError;
use crate::lock::repo_lock_name;
use crate::models::{Project, RepoRef, RunPhase, TriggerKind};
use crate::progress::{fail_run, RunTracker, SyncProgressReporter};
use crate::reconcile::{
    embed_file, load_for_rechunk, plan_delta, plan_full, remove_file, sync_file, EmbedJob,
    FileDelta, FileOutcome, PathFilter, SyncPlan,
};
use crate::store;

/// How many commits an import seeds into the history.
const IMPORT_COMMIT_LIMIT: usize = 100;

/// What to synchronize and how.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub trigger: TriggerKind,
    /// Adopt this `pending`/`running` run instead of creating one.
    pub run_id: Option<String>,
    /// Push delta. `None` means a full-tree reconciliation.
    pub delta: Option<FileDelta>,
    /// Ref to read file contents at. Defaults to the project's branch.
    pub git_ref: Option<String>,
}

impl SyncOptions {
    pub fn full(trigger: TriggerKind) -> Self {
        Self {
            trigger,
            run_id: None,
            delta: None,
            git_ref: None,
        }
    }

    pub fn push(delta: FileDelta, head: &str) -> Self {
        Self {
            trigger: TriggerKind::Push,
            run_id: None,
            delta: Some(delta),
            git_ref: Some(head.to_string()),
        }
    }

    pub fn with_run_id(mut self, run_id: Option<String>) -> Self {
        self.run_id = run_id;
        self
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub files_total: usize,
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_rechunked: usize,
    pub chunks_written: usize,
    /// Paths that got a new version or were removed.
    pub changed_paths: Vec<String>,
    pub failures: Vec<SyncError>,
    /// Reason analysis regeneration was requested, if it was.
    pub analysis: Option<String>,
}

impl SyncReport {
    pub fn print(&self, project: &str) {
        println!("sync {}", project);
        println!("  run: {}", self.run_id);
        println!("  files considered: {}", self.files_total);
        println!("  updated: {}", self.files_updated);
        println!("  unchanged: {}", self.files_unchanged);
        println!("  removed: {}", self.files_removed);
        if self.files_rechunked > 0 {
            println!("  re-chunked: {}", self.files_rechunked);
        }
        println!("  chunks written: {}", self.chunks_written);
        if let Some(reason) = &self.analysis {
            println!("  analysis: {}", reason);
        }
        if !self.failures.is_empty() {
            println!("  failures: {}", self.failures.len());
            for f in &self.failures {
                println!("    {}: {}", f.context.get("path").map(String::as_str).unwrap_or("?"), f.message);
            }
        }
        println!("ok");
    }
}

/// Run one synchronization of `project` under its repository lock.
///
/// The lock is released on every exit path. If the lock cannot be claimed
/// and `opts.run_id` names a pending run, that run is marked failed.
pub async fn run_sync(
    ctx: &AppContext,
    project: &Project,
    opts: SyncOptions,
    reporter: Arc<dyn SyncProgressReporter>,
) -> Result<SyncReport> {
    let lock_name = repo_lock_name(&project.repo_ref());
    let lease = match ctx.locks.claim(&lock_name, ctx.config.sync.lock_lease_secs).await {
        Ok(lease) => lease,
        Err(e) => {
            if let Some(run_id) = &opts.run_id {
                let err = SyncError::run_failure(run_id, "pending", &e);
                if let Err(mark) = fail_run(&ctx.pool, run_id, &err).await {
                    warn!(run_id = %run_id, error = %mark, "failed to mark run failed");
                }
            }
            return Err(e);
        }
    };

    let result = run_locked(ctx, project, opts, reporter).await;
    ctx.locks.release_lease(&lease).await;
    result
}

async fn run_locked(
    ctx: &AppContext,
    project: &Project,
    opts: SyncOptions,
    reporter: Arc<dyn SyncProgressReporter>,
) -> Result<SyncReport> {
    let mut tracker = RunTracker::start(
        &ctx.pool,
        &project.id,
        &project.full_name(),
        opts.trigger,
        opts.run_id.as_deref(),
        ctx.config.sync.progress_flush_every,
        reporter,
    )
    .await?;

    match execute(ctx, project, &opts, &mut tracker).await {
        Ok(report) => {
            tracker.complete().await?;
            Ok(report)
        }
        Err(e) => {
            let err = SyncError::run_failure(tracker.run_id(), tracker.phase().as_str(), &e);
            tracker.fail(&err).await?;
            Err(err.into())
        }
    }
}

async fn execute(
    ctx: &AppContext,
    project: &Project,
    opts: &SyncOptions,
    tracker: &mut RunTracker,
) -> Result<SyncReport> {
    let repo = project.repo_ref();
    let filter = PathFilter::from_config(&ctx.config.sync)?;
    let concurrency = ctx.config.sync.concurrency.max(1);
    let git_ref = opts
        .git_ref
        .clone()
        .unwrap_or_else(|| project.default_branch.clone());

    let plan = match &opts.delta {
        Some(delta) => plan_delta(delta, &filter),
        None => full_plan(ctx, project, &filter).await?,
    };

    let mut report = SyncReport {
        run_id: tracker.run_id().to_string(),
        files_total: plan.total(),
        ..Default::default()
    };
    tracker.add_files_total(plan.total() as i64);
    info!(
        project = %repo,
        run_id = %tracker.run_id(),
        sync = plan.to_sync.len(),
        remove = plan.to_remove.len(),
        rechunk = plan.to_rechunk.len(),
        "plan ready"
    );

    // ── indexing ──
    let mut embed_jobs: Vec<EmbedJob> = Vec::new();

    for batch in plan.to_sync.chunks(concurrency) {
        let results = join_all(
            batch
                .iter()
                .map(|path| sync_file(ctx, project, &filter, path, &git_ref)),
        )
        .await;
        for (path, result) in batch.iter().zip(results) {
            match result {
                Ok(FileOutcome::Updated(job)) => {
                    report.files_updated += 1;
                    report.changed_paths.push(path.clone());
                    embed_jobs.push(job);
                }
                Ok(FileOutcome::Removed) => {
                    report.files_removed += 1;
                    report.changed_paths.push(path.clone());
                }
                Ok(FileOutcome::Unchanged) | Ok(FileOutcome::Absent) => report.files_unchanged += 1,
                Err(e) => record_failure(&mut report, path, &e),
            }
            tracker.record_file(0).await?;
        }
        tracker.flush().await?;
    }

    for batch in plan.to_remove.chunks(concurrency) {
        let results = join_all(batch.iter().map(|path| remove_file(ctx, project, path))).await;
        for (path, result) in batch.iter().zip(results) {
            match result {
                Ok(FileOutcome::Removed) => {
                    report.files_removed += 1;
                    report.changed_paths.push(path.clone());
                }
                Ok(_) => report.files_unchanged += 1,
                Err(e) => record_failure(&mut report, path, &e),
            }
            tracker.record_file(0).await?;
        }
        tracker.flush().await?;
    }

    for batch in plan.to_rechunk.chunks(concurrency) {
        let results = join_all(batch.iter().map(|file| load_for_rechunk(ctx, file))).await;
        for (file, result) in batch.iter().zip(results) {
            match result {
                Ok(job) => {
                    report.files_rechunked += 1;
                    embed_jobs.push(job);
                }
                Err(e) => record_failure(&mut report, &file.path, &e),
            }
            tracker.record_file(0).await?;
        }
        tracker.flush().await?;
    }

    // ── embedding ──
    tracker.enter_phase(RunPhase::Embedding).await?;
    if !ctx.embedder.is_enabled() && !embed_jobs.is_empty() {
        info!(project = %repo, "embeddings disabled; storing chunks without vectors");
    }
    for batch in embed_jobs.chunks(concurrency) {
        let results = join_all(batch.iter().map(|job| embed_file(ctx, job))).await;
        for (job, result) in batch.iter().zip(results) {
            match result {
                Ok(n) => {
                    report.chunks_written += n;
                    tracker.add_chunks(n as i64);
                }
                Err(e) => record_failure(&mut report, &job.file.path, &e),
            }
        }
        tracker.flush().await?;
    }

    // ── review ──
    tracker.enter_phase(RunPhase::Review).await?;
    report.analysis = review(ctx, project, opts.trigger, &report, tracker).await;

    info!(
        project = %repo,
        run_id = %tracker.run_id(),
        updated = report.files_updated,
        removed = report.files_removed,
        chunks = report.chunks_written,
        failures = report.failures.len(),
        "sync finished"
    );
    Ok(report)
}

async fn full_plan(ctx: &AppContext, project: &Project, filter: &PathFilter) -> Result<SyncPlan> {
    let tree = ctx
        .host
        .tree(&project.repo_ref(), &project.default_branch)
        .await?;
    if tree.truncated {
        warn!(project = %project.full_name(), "tree listing truncated; removals skipped this run");
    }
    let current = store::current_files(&ctx.pool, &project.id).await?;
    let missing = store::files_missing_chunks(&ctx.pool, &project.id).await?;
    Ok(plan_full(&tree, &current, &missing, filter))
}

fn record_failure(report: &mut SyncReport, path: &str, err: &anyhow::Error) {
    warn!(path, error = %format!("{:#}", err), "file sync failed");
    report.failures.push(SyncError::file_failure(path, err));
}

/// Analysis step. Import and rescan regenerate inline and count it as the
/// single review step; push and sanity check apply the regeneration policy
/// and hand the work to a detached task. Failures never fail the run.
async fn review(
    ctx: &AppContext,
    project: &Project,
    trigger: TriggerKind,
    report: &SyncReport,
    tracker: &mut RunTracker,
) -> Option<String> {
    if !ctx.analyzer.is_enabled() {
        return None;
    }
    match trigger {
        TriggerKind::Import | TriggerKind::Rescan => {
            tracker.set_review_total(1);
            let reason = trigger.as_str();
            if let Err(e) = analysis::regenerate(ctx, project, reason).await {
                warn!(project = %project.full_name(), error = %format!("{:#}", e), "analysis failed");
            }
            if let Err(e) = tracker.record_review_step().await {
                warn!(run_id = %tracker.run_id(), error = %e, "failed to record review progress");
            }
            Some(reason.to_string())
        }
        TriggerKind::Push | TriggerKind::SanityCheck => {
            match analysis::maybe_regenerate_after_push(ctx, project, &report.changed_paths).await {
                Ok(reason) => reason.map(str::to_string),
                Err(e) => {
                    warn!(project = %project.full_name(), error = %e, "analysis policy check failed");
                    None
                }
            }
        }
    }
}

/// Register a repository and run its first full synchronization.
///
/// Importing an already tracked repository re-runs the sync against the
/// existing project.
pub async fn import_project(
    ctx: &AppContext,
    repo: &RepoRef,
    reporter: Arc<dyn SyncProgressReporter>,
) -> Result<(Project, SyncReport)> {
    let info = ctx.host.repository(repo).await?;
    let project = store::insert_project(
        &ctx.pool,
        &info.owner,
        &info.name,
        &info.html_url,
        &info.default_branch,
    )
    .await?;
    info!(project = %project.full_name(), branch = %project.default_branch, "project registered");

    match ctx
        .host
        .commits(&project.repo_ref(), &project.default_branch, IMPORT_COMMIT_LIMIT)
        .await
    {
        Ok(commits) => {
            let mut added = 0;
            for commit in &commits {
                if store::upsert_commit(&ctx.pool, &project.id, commit).await? {
                    added += 1;
                }
            }
            info!(project = %project.full_name(), added, "commit history seeded");
        }
        Err(e) => warn!(project = %project.full_name(), error = %format!("{:#}", e), "commit history unavailable"),
    }

    let report = run_sync(ctx, &project, SyncOptions::full(TriggerKind::Import), reporter).await?;
    Ok((project, report))
}

/// Full reconciliation of every project, one after another.
pub async fn sanity_check_all(
    ctx: &AppContext,
    reporter: Arc<dyn SyncProgressReporter>,
) -> Result<Vec<(Project, Result<SyncReport>)>> {
    let projects = store::list_projects(&ctx.pool).await?;
    let mut results = Vec::with_capacity(projects.len());
    for project in projects {
        let result = run_sync(
            ctx,
            &project,
            SyncOptions::full(TriggerKind::SanityCheck),
            reporter.clone(),
        )
        .await;
        if let Err(e) = &result {
            warn!(project = %project.full_name(), error = %format!("{:#}", e), "sanity check failed");
        }
        results.push((project, result));
    }
    Ok(results)
}
