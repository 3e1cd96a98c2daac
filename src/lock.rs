//! Lease-based job locks stored in SQLite.
//!
//! A lock row `(name, holder, acquired_at, expires_at)` grants exclusive
//! execution rights for `name` until `expires_at`. Locks are never renewed:
//! a holder that crashes simply lets its lease run out, after which the next
//! claimant cleans it up.
//!
//! ```text
//!   unlocked ──acquire──▶ leased ──now ≥ expires_at──▶ expired
//!      ▲                    │                            │
//!      └──────release───────┘◀────────cleanup────────────┘
//! ```
//!
//! [`lease_state`] computes the state from `(now, expires_at)` alone, so
//! lease rules are testable without a database.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::now_ts;
use crate::error::SyncError;
use crate::models::{JobLock, RepoRef};

/// How many plain acquire attempts `claim` makes before forcing.
pub const CLAIM_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Unlocked,
    Leased,
    Expired,
}

/// State of a lock given the current time and the row's expiry, if any.
pub fn lease_state(now: i64, expires_at: Option<i64>) -> LeaseState {
    match expires_at {
        None => LeaseState::Unlocked,
        Some(exp) if now < exp => LeaseState::Leased,
        Some(_) => LeaseState::Expired,
    }
}

/// A lock row is valid while `now < expires_at`.
pub fn is_lock_valid(now: i64, expires_at: i64) -> bool {
    lease_state(now, Some(expires_at)) == LeaseState::Leased
}

/// Lock name shared by every trigger against one repository.
pub fn repo_lock_name(repo: &RepoRef) -> String {
    format!("webhook:{}/{}", repo.owner, repo.name)
}

/// How a claim was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockClaim {
    Acquired,
    /// The lock was still held after all attempts and was overwritten.
    Forced,
}

/// A claimed lease. Pass it back to [`JobLocks::release_lease`].
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub claim: LockClaim,
}

#[derive(Clone)]
pub struct JobLocks {
    pool: SqlitePool,
    retry_delay: Duration,
}

impl JobLocks {
    pub fn new(pool: SqlitePool, retry_delay: Duration) -> Self {
        Self { pool, retry_delay }
    }

    /// Insert the lock unless an unexpired row exists. An expired row is
    /// taken over in the same statement.
    pub async fn acquire(&self, name: &str, holder: &str, lease_secs: i64) -> Result<bool> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (name, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE job_locks.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + lease_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrite the lock unconditionally.
    ///
    /// `lease_secs = 0` leaves an already-expired row, which releases the
    /// lock regardless of who held it.
    pub async fn force_acquire(&self, name: &str, holder: &str, lease_secs: i64) -> Result<bool> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO job_locks (name, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + lease_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the lock if `holder` still owns it. Returns whether a row was removed.
    pub async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release a claimed lease, logging instead of failing.
    pub async fn release_lease(&self, lease: &Lease) {
        match self.release(&lease.name, &lease.holder).await {
            Ok(true) => debug!(lock = %lease.name, "lock released"),
            Ok(false) => warn!(lock = %lease.name, "lock was taken over before release"),
            Err(e) => warn!(lock = %lease.name, error = %e, "failed to release lock"),
        }
    }

    /// Delete every expired lock.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_locks WHERE expires_at <= ?")
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Claim `name` for `lease_secs`.
    ///
    /// Cleans up expired locks, tries [`acquire`](Self::acquire) up to
    /// [`CLAIM_ATTEMPTS`] times, then falls back to
    /// [`force_acquire`](Self::force_acquire). Only a failure of that last
    /// step is returned, as a `LockContention` error.
    pub async fn claim(&self, name: &str, lease_secs: i64) -> Result<Lease> {
        let holder = Uuid::new_v4().to_string();

        match self.cleanup_expired().await {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "cleaned up expired locks"),
            Err(e) => warn!(lock = name, error = %e, "expired lock cleanup failed"),
        }

        for attempt in 1..=CLAIM_ATTEMPTS {
            match self.acquire(name, &holder, lease_secs).await {
                Ok(true) => {
                    debug!(lock = name, attempt, "lock acquired");
                    return Ok(Lease {
                        name: name.to_string(),
                        holder,
                        claim: LockClaim::Acquired,
                    });
                }
                Ok(false) => debug!(lock = name, attempt, "lock busy"),
                Err(e) => warn!(lock = name, attempt, error = %e, "lock acquire failed"),
            }
            if attempt < CLAIM_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        match self.force_acquire(name, &holder, lease_secs).await {
            Ok(_) => {
                warn!(lock = name, "lock still held after retries; forced takeover");
                Ok(Lease {
                    name: name.to_string(),
                    holder,
                    claim: LockClaim::Forced,
                })
            }
            Err(e) => Err(SyncError::lock_contention(name, format!("could not claim lock: {:#}", e))
                .into()),
        }
    }

    /// Current row for `name` and its state.
    pub async fn inspect(&self, name: &str) -> Result<Option<(JobLock, LeaseState)>> {
        let row = sqlx::query("SELECT name, holder, acquired_at, expires_at FROM job_locks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let lock = JobLock {
                name: row.get("name"),
                holder: row.get("holder"),
                acquired_at: row.get("acquired_at"),
                expires_at: row.get("expires_at"),
            };
            let state = lease_state(now_ts(), Some(lock.expires_at));
            (lock, state)
        }))
    }
}
