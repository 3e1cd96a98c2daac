//! Durable webhook job queue.
//!
//! In `webhook.mode = "queue"` a verified delivery is persisted as a
//! [`WebhookJob`] and acknowledged with 202; a worker drains the table later.
//!
//! ```text
//! pending ──claim──▶ running ──ok──▶ done
//!    ▲                  │
//!    └──retry < max─────┤ (not claimable again until next_attempt_at)
//!                       └──retry = max──▶ error
//! ```
//!
//! A failed attempt pushes `next_attempt_at` out by `queue.retry_base_secs`,
//! doubling per retry up to `queue.retry_max_secs`, so back-to-back drains
//! during an outage do not burn through the retry budget.
//!
//! Claiming is a conditional `pending → running` update, so two workers never
//! process the same job. Jobs left `running` by a crashed worker are returned
//! to `pending` by [`recover_stale`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::db::now_ts;
use crate::error::{ErrorKind, SyncError};
use crate::models::{JobStatus, WebhookJob};
use crate::progress::NoProgress;
use crate::retry::RetryPolicy;
use crate::webhook::{process_push, PushEvent, PushOutcome};

fn job_from_row(row: &SqliteRow) -> Result<WebhookJob> {
    let status: String = row.get("status");
    Ok(WebhookJob {
        id: row.get("id"),
        event: row.get("event"),
        delivery_id: row.get("delivery_id"),
        payload: row.get("payload"),
        status: status.parse()?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        last_error: row.get("last_error"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Persist a delivery. Returns the job id and whether a new row was written;
/// a delivery id seen before maps to its existing job.
pub async fn enqueue(
    pool: &SqlitePool,
    event: &str,
    delivery_id: Option<&str>,
    payload: &str,
    max_retries: i64,
) -> Result<(String, bool)> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO webhook_jobs
            (id, event, delivery_id, payload, status, retry_count, max_retries, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(event)
    .bind(delivery_id)
    .bind(payload)
    .bind(max_retries)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        debug!(job_id = %id, event, "job enqueued");
        return Ok((id, true));
    }

    let existing: String = sqlx::query_scalar("SELECT id FROM webhook_jobs WHERE delivery_id = ?")
        .bind(delivery_id)
        .fetch_one(pool)
        .await?;
    debug!(job_id = %existing, "duplicate delivery; job already queued");
    Ok((existing, false))
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<WebhookJob>> {
    let row = sqlx::query("SELECT * FROM webhook_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

async fn claim_job(pool: &SqlitePool, id: &str) -> Result<bool> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE webhook_jobs SET status = 'running', updated_at = ?
        WHERE id = ? AND status = 'pending' AND next_attempt_at <= ?
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn finish_job(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE webhook_jobs SET status = 'done', updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Count a failed attempt and schedule the next one. Returns the job's new status.
async fn fail_job(
    pool: &SqlitePool,
    job: &WebhookJob,
    err: &anyhow::Error,
    backoff: &RetryPolicy,
) -> Result<JobStatus> {
    let retry_count = job.retry_count + 1;
    let status = if retry_count >= job.max_retries {
        JobStatus::Error
    } else {
        JobStatus::Pending
    };
    let now = now_ts();
    let delay = backoff.delay_for(retry_count.min(32) as u32 + 1);
    let next_attempt_at = now + delay.as_secs() as i64;
    let message = format!("{:#}", err);
    sqlx::query(
        r#"
        UPDATE webhook_jobs
        SET status = ?, retry_count = ?, last_error = ?, next_attempt_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(retry_count)
    .bind(&message)
    .bind(next_attempt_at)
    .bind(now)
    .bind(&job.id)
    .execute(pool)
    .await?;

    if status == JobStatus::Error {
        let exhausted = SyncError::new(ErrorKind::QueueExhausted, message)
            .with("job_id", &job.id)
            .with("retries", retry_count);
        error!(job_id = %job.id, error = %exhausted, "job gave up");
    } else {
        warn!(
            job_id = %job.id,
            retry_count,
            max_retries = job.max_retries,
            retry_in_secs = delay.as_secs(),
            error = %message,
            "job failed; will retry"
        );
    }
    Ok(status)
}

/// Counts from one [`drain_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub exhausted: usize,
    /// Jobs another worker claimed first.
    pub skipped: usize,
}

async fn process_job(ctx: &AppContext, job: &WebhookJob) -> Result<()> {
    if job.event != "push" {
        debug!(job_id = %job.id, event = %job.event, "non-push job ignored");
        return Ok(());
    }
    let push = PushEvent::parse(job.payload.as_bytes())?;
    match process_push(ctx, &push, Arc::new(NoProgress)).await? {
        PushOutcome::Ignored(reason) => debug!(job_id = %job.id, reason, "push ignored"),
        PushOutcome::Synced(report) => info!(
            job_id = %job.id,
            run_id = %report.run_id,
            updated = report.files_updated,
            removed = report.files_removed,
            "push synced"
        ),
    }
    Ok(())
}

/// Process up to `batch` due pending jobs, oldest first.
pub async fn drain_once(ctx: &AppContext, batch: i64) -> Result<DrainStats> {
    let backoff = ctx.config.queue.backoff();
    let rows = sqlx::query(
        r#"
        SELECT * FROM webhook_jobs
        WHERE status = 'pending' AND next_attempt_at <= ?
        ORDER BY created_at, rowid
        LIMIT ?
        "#,
    )
    .bind(now_ts())
    .bind(batch)
    .fetch_all(&ctx.pool)
    .await?;
    let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;

    let mut stats = DrainStats::default();
    for job in jobs {
        if !claim_job(&ctx.pool, &job.id).await? {
            stats.skipped += 1;
            continue;
        }
        stats.claimed += 1;

        match process_job(ctx, &job).await {
            Ok(()) => {
                finish_job(&ctx.pool, &job.id).await?;
                stats.done += 1;
            }
            Err(e) => match fail_job(&ctx.pool, &job, &e, &backoff).await? {
                JobStatus::Error => stats.exhausted += 1,
                _ => stats.retried += 1,
            },
        }
    }
    if stats.claimed > 0 {
        info!(
            claimed = stats.claimed,
            done = stats.done,
            retried = stats.retried,
            exhausted = stats.exhausted,
            "queue drained"
        );
    }
    Ok(stats)
}

/// Return `running` jobs untouched for `older_than_secs` to `pending`.
pub async fn recover_stale(pool: &SqlitePool, older_than_secs: i64) -> Result<u64> {
    let now = now_ts();
    let result = sqlx::query(
        "UPDATE webhook_jobs SET status = 'pending', updated_at = ? WHERE status = 'running' AND updated_at < ?",
    )
    .bind(now)
    .bind(now - older_than_secs)
    .execute(pool)
    .await?;
    if result.rows_affected() > 0 {
        warn!(count = result.rows_affected(), "recovered stale running jobs");
    }
    Ok(result.rows_affected())
}

/// Poll the queue every `interval` until `shutdown` is cancelled.
pub async fn run_worker(ctx: &AppContext, interval: Duration, shutdown: CancellationToken) -> Result<()> {
    let queue = &ctx.config.queue;
    info!(interval_secs = interval.as_secs(), batch = queue.batch_size, "queue worker started");
    loop {
        if let Err(e) = recover_stale(&ctx.pool, queue.stale_after_secs).await {
            warn!(error = %e, "stale job recovery failed");
        }
        if let Err(e) = drain_once(ctx, queue.batch_size).await {
            warn!(error = %format!("{:#}", e), "queue drain failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("queue worker stopped");
    Ok(())
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub error: i64,
}

pub async fn queue_stats(pool: &SqlitePool) -> Result<QueueStats> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM webhook_jobs GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut stats = QueueStats::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.parse::<JobStatus>() {
            Ok(JobStatus::Pending) => stats.pending = n,
            Ok(JobStatus::Running) => stats.running = n,
            Ok(JobStatus::Done) => stats.done = n,
            Ok(JobStatus::Error) => stats.error = n,
            Err(_) => warn!(status = %status, "unknown job status in queue"),
        }
    }
    Ok(stats)
}
