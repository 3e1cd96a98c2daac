//! Ingestion run state machine, progress counters and CLI reporters.
//!
//! A run moves `pending → running(indexing) → running(embedding) →
//! running(review) → completed(done)`, or to `failed(failed)` from any
//! running phase. [`RunTracker`] owns one run while the pipeline holds the
//! repository lock: phase changes are explicit [`RunTracker::enter_phase`]
//! calls, and counters are accumulated in memory and flushed every
//! `sync.progress_flush_every` files, at phase boundaries and at the end.
//! Flushes use `MAX()` so stored counters never decrease.
//!
//! Live progress is also reported to a [`SyncProgressReporter`] on
//! **stderr**, so stdout stays parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::now_ts;
use crate::error::{ErrorKind, SyncError};
use crate::models::{IngestionRun, RunPhase, RunStatus, ScanProgress, TriggerKind};

// ═══════════════════════════════════════════════════════════════════════
// Reporters
// ═══════════════════════════════════════════════════════════════════════

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    Phase {
        project: String,
        run_id: String,
        phase: RunPhase,
    },
    Counters {
        project: String,
        progress: ScanProgress,
    },
    Finished {
        project: String,
        status: RunStatus,
    },
}

/// Receives progress events from the tracker.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync acme/docs  indexing  12 / 40 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Phase { project, phase, .. } => {
                format!("sync {}  {}...\n", project, phase)
            }
            SyncProgressEvent::Counters { project, progress } => format!(
                "sync {}  {} / {} files  {} chunks\n",
                project,
                format_number(progress.files_indexed.max(0) as u64),
                format_number(progress.files_total.max(0) as u64),
                format_number(progress.chunks.max(0) as u64)
            ),
            SyncProgressEvent::Finished { project, status } => {
                format!("sync {}  {}\n", project, status)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Phase {
                project,
                run_id,
                phase,
            } => serde_json::json!({
                "event": "phase",
                "project": project,
                "run_id": run_id,
                "phase": phase,
            }),
            SyncProgressEvent::Counters { project, progress } => serde_json::json!({
                "event": "counters",
                "project": project,
                "total": progress.files_total,
                "indexed": progress.files_indexed,
                "chunks": progress.chunks,
                "review_done": progress.review_done,
                "review_total": progress.review_total,
            }),
            SyncProgressEvent::Finished { project, status } => serde_json::json!({
                "event": "done",
                "project": project,
                "status": status,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Run records
// ═══════════════════════════════════════════════════════════════════════

/// A run plus its counters, as served to pollers and streams.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run: IngestionRun,
    pub progress: ScanProgress,
}

fn run_from_row(row: &SqliteRow) -> Result<IngestionRun> {
    let trigger: String = row.get("trigger");
    let phase: String = row.get("phase");
    let status: String = row.get("status");
    let error: Option<String> = row.get("error");
    Ok(IngestionRun {
        id: row.get("id"),
        project_id: row.get("project_id"),
        trigger: trigger.parse()?,
        phase: phase.parse()?,
        status: status.parse()?,
        error: error.and_then(|e| serde_json::from_str(&e).ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        finished_at: row.get("finished_at"),
    })
}

pub async fn load_run(pool: &SqlitePool, run_id: &str) -> Result<Option<IngestionRun>> {
    let row = sqlx::query("SELECT * FROM ingestion_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

pub async fn load_progress(pool: &SqlitePool, run_id: &str) -> Result<ScanProgress> {
    let row = sqlx::query(
        "SELECT files_total, files_indexed, chunks, review_done, review_total FROM scan_progress WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(row
        .map(|r| ScanProgress {
            files_total: r.get("files_total"),
            files_indexed: r.get("files_indexed"),
            chunks: r.get("chunks"),
            review_done: r.get("review_done"),
            review_total: r.get("review_total"),
        })
        .unwrap_or_default())
}

/// Run and counters for polling. `None` for an unknown id.
pub async fn load_snapshot(pool: &SqlitePool, run_id: &str) -> Result<Option<RunSnapshot>> {
    let Some(run) = load_run(pool, run_id).await? else {
        return Ok(None);
    };
    let progress = load_progress(pool, run_id).await?;
    Ok(Some(RunSnapshot { run, progress }))
}

/// Most recent runs of a project, newest first.
pub async fn latest_runs(pool: &SqlitePool, project_id: &str, limit: i64) -> Result<Vec<IngestionRun>> {
    let rows = sqlx::query(
        "SELECT * FROM ingestion_runs WHERE project_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(run_from_row).collect()
}

/// The project's `pending` or `running` run, if any.
pub async fn active_run(pool: &SqlitePool, project_id: &str) -> Result<Option<IngestionRun>> {
    let row = sqlx::query(
        "SELECT * FROM ingestion_runs WHERE project_id = ? AND status IN ('pending', 'running') ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(run_from_row).transpose()
}

async fn insert_run(pool: &SqlitePool, project_id: &str, trigger: TriggerKind, status: RunStatus) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO ingestion_runs (id, project_id, trigger, phase, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(project_id)
    .bind(trigger.as_str())
    .bind(RunPhase::Indexing.as_str())
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO scan_progress (run_id, updated_at) VALUES (?, ?)")
        .bind(&id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

/// Create a `pending` run for an HTTP trigger to hand to a detached pipeline.
///
/// When the project already has a pending or running run, that run's id is
/// returned instead and the flag is `false`. A `pending` run untouched for
/// longer than `stale_after_secs` was never adopted (its task died before
/// claiming the lease); it is failed as superseded and a fresh run created.
pub async fn create_pending_run(
    pool: &SqlitePool,
    project_id: &str,
    trigger: TriggerKind,
    stale_after_secs: i64,
) -> Result<(String, bool)> {
    if let Some(run) = active_run(pool, project_id).await? {
        let orphaned = run.status == RunStatus::Pending && now_ts() - run.updated_at > stale_after_secs;
        if !orphaned {
            return Ok((run.id, false));
        }
        let id = insert_run(pool, project_id, trigger, RunStatus::Pending).await?;
        let err = SyncError::new(ErrorKind::RunFailure, "pending run was never started")
            .with("superseded_by", &id);
        fail_run(pool, &run.id, &err).await?;
        warn!(run_id = %run.id, superseded_by = %id, "failed orphaned pending run");
        return Ok((id, true));
    }
    let id = insert_run(pool, project_id, trigger, RunStatus::Pending).await?;
    Ok((id, true))
}

/// Mark a non-terminal run failed. Used when a pipeline dies before it could
/// adopt its run (for example when the lock cannot be claimed).
pub async fn fail_run(pool: &SqlitePool, run_id: &str, err: &SyncError) -> Result<()> {
    let now = now_ts();
    sqlx::query(
        r#"
        UPDATE ingestion_runs
        SET phase = 'failed', status = 'failed', error = ?, updated_at = ?, finished_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(err.to_json())
    .bind(now)
    .bind(now)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Tracker
// ═══════════════════════════════════════════════════════════════════════

/// Owner of one running ingestion run.
pub struct RunTracker {
    pool: SqlitePool,
    run_id: String,
    label: String,
    phase: RunPhase,
    progress: ScanProgress,
    flush_every: u64,
    unflushed_files: u64,
    reporter: Arc<dyn SyncProgressReporter>,
}

impl RunTracker {
    /// Start or adopt a run for `project_id` and mark it running in `indexing`.
    ///
    /// A supplied `run_id` that is `pending`/`running` for the same project
    /// is adopted; otherwise a new run is created. Any other `pending` or
    /// `running` run of the project is failed as superseded.
    pub async fn start(
        pool: &SqlitePool,
        project_id: &str,
        label: &str,
        trigger: TriggerKind,
        run_id: Option<&str>,
        flush_every: u64,
        reporter: Arc<dyn SyncProgressReporter>,
    ) -> Result<Self> {
        let adopted = match run_id {
            Some(id) => match load_run(pool, id).await? {
                Some(run) if run.project_id == project_id && !run.status.is_terminal() => Some(run),
                Some(run) => {
                    warn!(run_id = %id, status = %run.status, "requested run is not adoptable; starting a new one");
                    None
                }
                None => {
                    warn!(run_id = %id, "requested run not found; starting a new one");
                    None
                }
            },
            None => None,
        };

        let (id, progress) = match adopted {
            Some(run) => {
                debug!(run_id = %run.id, "adopting existing run");
                let progress = load_progress(pool, &run.id).await?;
                (run.id, progress)
            }
            None => (
                insert_run(pool, project_id, trigger, RunStatus::Running).await?,
                ScanProgress::default(),
            ),
        };

        let superseded = SyncError::new(ErrorKind::RunFailure, "superseded by a newer run")
            .with("superseded_by", &id);
        let now = now_ts();
        let stale = sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET phase = 'failed', status = 'failed', error = ?, updated_at = ?, finished_at = ?
            WHERE project_id = ? AND status IN ('pending', 'running') AND id != ?
            "#,
        )
        .bind(superseded.to_json())
        .bind(now)
        .bind(now)
        .bind(project_id)
        .bind(&id)
        .execute(pool)
        .await?;
        if stale.rows_affected() > 0 {
            warn!(project = label, count = stale.rows_affected(), "failed superseded runs");
        }

        sqlx::query("INSERT OR IGNORE INTO scan_progress (run_id, updated_at) VALUES (?, ?)")
            .bind(&id)
            .bind(now)
            .execute(pool)
            .await?;

        let mut tracker = Self {
            pool: pool.clone(),
            run_id: id,
            label: label.to_string(),
            phase: RunPhase::Indexing,
            progress,
            flush_every: flush_every.max(1),
            unflushed_files: 0,
            reporter,
        };
        tracker.write_phase(RunPhase::Indexing, RunStatus::Running, None).await?;
        info!(project = label, run_id = %tracker.run_id, trigger = %trigger, "run started");
        Ok(tracker)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    async fn write_phase(&mut self, phase: RunPhase, status: RunStatus, error: Option<&SyncError>) -> Result<()> {
        let now = now_ts();
        let finished_at = status.is_terminal().then_some(now);
        sqlx::query(
            r#"
            UPDATE ingestion_runs
            SET phase = ?, status = ?, error = COALESCE(?, error), updated_at = ?, finished_at = COALESCE(?, finished_at)
            WHERE id = ?
            "#,
        )
        .bind(phase.as_str())
        .bind(status.as_str())
        .bind(error.map(|e| e.to_json()))
        .bind(now)
        .bind(finished_at)
        .bind(&self.run_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to move run {} to {}", self.run_id, phase))?;

        self.phase = phase;
        self.reporter.report(SyncProgressEvent::Phase {
            project: self.label.clone(),
            run_id: self.run_id.clone(),
            phase,
        });
        Ok(())
    }

    /// Flush counters and move to `phase`. Illegal transitions are rejected.
    pub async fn enter_phase(&mut self, phase: RunPhase) -> Result<()> {
        if !self.phase.can_advance_to(phase) || phase.is_terminal() {
            bail!("illegal run transition {} -> {}", self.phase, phase);
        }
        self.flush().await?;
        if phase != self.phase {
            debug!(run_id = %self.run_id, from = %self.phase, to = %phase, "phase transition");
        }
        self.write_phase(phase, RunStatus::Running, None).await
    }

    /// Write the in-memory counters. Stored values only ever grow.
    pub async fn flush(&mut self) -> Result<()> {
        let p = self.progress;
        sqlx::query(
            r#"
            UPDATE scan_progress SET
                files_total = MAX(files_total, ?),
                files_indexed = MAX(files_indexed, ?),
                chunks = MAX(chunks, ?),
                review_done = MAX(review_done, ?),
                review_total = MAX(review_total, ?),
                updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(p.files_total)
        .bind(p.files_indexed)
        .bind(p.chunks)
        .bind(p.review_done)
        .bind(p.review_total)
        .bind(now_ts())
        .bind(&self.run_id)
        .execute(&self.pool)
        .await?;
        self.unflushed_files = 0;
        self.reporter.report(SyncProgressEvent::Counters {
            project: self.label.clone(),
            progress: p,
        });
        Ok(())
    }

    pub fn add_files_total(&mut self, n: i64) {
        self.progress.files_total += n;
    }

    pub fn add_chunks(&mut self, n: i64) {
        self.progress.chunks += n;
    }

    pub fn set_review_total(&mut self, n: i64) {
        self.progress.review_total = self.progress.review_total.max(n);
    }

    /// Count one processed file with the chunks it produced, flushing every
    /// `flush_every` files.
    pub async fn record_file(&mut self, chunks: i64) -> Result<()> {
        self.progress.files_indexed += 1;
        self.progress.chunks += chunks;
        self.unflushed_files += 1;
        if self.unflushed_files >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn record_review_step(&mut self) -> Result<()> {
        self.progress.review_done += 1;
        self.flush().await
    }

    /// Flush and finish as `completed/done`.
    pub async fn complete(mut self) -> Result<()> {
        self.flush().await?;
        self.write_phase(RunPhase::Done, RunStatus::Completed, None).await?;
        self.reporter.report(SyncProgressEvent::Finished {
            project: self.label.clone(),
            status: RunStatus::Completed,
        });
        info!(project = %self.label, run_id = %self.run_id, "run completed");
        Ok(())
    }

    /// Flush and finish as `failed/failed` with the serialized error.
    pub async fn fail(mut self, err: &SyncError) -> Result<()> {
        if let Err(e) = self.flush().await {
            warn!(run_id = %self.run_id, error = %e, "failed to flush counters of failing run");
        }
        self.write_phase(RunPhase::Failed, RunStatus::Failed, Some(err)).await?;
        self.reporter.report(SyncProgressEvent::Finished {
            project: self.label.clone(),
            status: RunStatus::Failed,
        });
        warn!(project = %self.label, run_id = %self.run_id, error = %err, "run failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use crate::testutil::test_pool;

    async fn project(pool: &SqlitePool) -> String {
        store::insert_project(pool, "acme", "docs", "https://github.com/acme/docs", "main")
            .await
            .unwrap()
            .id
    }

    fn quiet() -> Arc<dyn SyncProgressReporter> {
        Arc::new(NoProgress)
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[tokio::test]
    async fn run_walks_phases_to_completion() {
        let (_dir, pool) = test_pool().await;
        let pid = project(&pool).await;
        let mut t = RunTracker::start(&pool, &pid, "acme/docs", TriggerKind::Import, None, 2, quiet())
            .await
            .unwrap();
        let id = t.run_id().to_string();
        t.add_files_total(3);
        t.record_file(4).await.unwrap();
        // Not flushed yet: one file below the threshold.
        assert_eq!(load_progress(&pool, &id).await.unwrap().files_indexed, 0);
        t.record_file(1).await.unwrap();
        assert_eq!(load_progress(&pool, &id).await.unwrap().files_indexed, 2);

        t.enter_phase(RunPhase::Embedding).await.unwrap();
        assert!(t.enter_phase(RunPhase::Indexing).await.is_err());
        t.enter_phase(RunPhase::Review).await.unwrap();
        t.complete().await.unwrap();

        let snap = load_snapshot(&pool, &id).await.unwrap().unwrap();
        assert_eq!(snap.run.status, RunStatus::Completed);
        assert_eq!(snap.run.phase, RunPhase::Done);
        assert!(snap.run.finished_at.is_some());
        assert_eq!(snap.progress.chunks, 5);
        assert_eq!(snap.progress.files_total, 3);
    }

    #[tokio::test]
    async fn pending_run_is_adopted_and_reused() {
        let (_dir, pool) = test_pool().await;
        let pid = project(&pool).await;
        let (id, created) = create_pending_run(&pool, &pid, TriggerKind::Rescan, 600).await.unwrap();
        assert!(created);
        let (again, created) = create_pending_run(&pool, &pid, TriggerKind::Rescan, 600).await.unwrap();
        assert_eq!(again, id);
        assert!(!created);

        let t = RunTracker::start(&pool, &pid, "acme/docs", TriggerKind::Rescan, Some(&id), 3, quiet())
            .await
            .unwrap();
        assert_eq!(t.run_id(), id);
        let run = load_run(&pool, &id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn stale_running_run_is_superseded() {
        let (_dir, pool) = test_pool().await;
        let pid = project(&pool).await;
        let crashed = RunTracker::start(&pool, &pid, "acme/docs", TriggerKind::Push, None, 3, quiet())
            .await
            .unwrap();
        let crashed_id = crashed.run_id().to_string();
        drop(crashed);

        let fresh = RunTracker::start(&pool, &pid, "acme/docs", TriggerKind::Push, None, 3, quiet())
            .await
            .unwrap();
        let old = load_run(&pool, &crashed_id).await.unwrap().unwrap();
        assert_eq!(old.status, RunStatus::Failed);
        assert_eq!(old.error.unwrap()["kind"], "run_failure");
        let runs = latest_runs(&pool, &pid, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(active_run(&pool, &pid).await.unwrap().unwrap().id, fresh.run_id());
    }

    #[tokio::test]
    async fn failure_records_structured_error() {
        let (_dir, pool) = test_pool().await;
        let pid = project(&pool).await;
        let t = RunTracker::start(&pool, &pid, "acme/docs", TriggerKind::Import, None, 3, quiet())
            .await
            .unwrap();
        let id = t.run_id().to_string();
        let err = SyncError::new(ErrorKind::RunFailure, "tree fetch failed").with("phase", "indexing");
        t.fail(&err).await.unwrap();
        let run = load_run(&pool, &id).await.unwrap().unwrap();
        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.unwrap()["context"]["phase"], "indexing");
    }
}
