//! # doc-mirror
//!
//! Mirrors a repository's documentation into a versioned, chunked and
//! embedded knowledge base, and keeps it in sync as the repository changes.
//!
//! Three trigger paths share one pipeline: the initial import, webhook push
//! deltas, and periodic full reconciliation (manual rescan or scheduled
//! sanity check). A lease-based lock per repository makes sure at most one
//! run touches a repository at a time.
//!
//! ## Architecture
//!
//! ```text
//!  import / rescan / cron          POST /webhooks/github
//!          │                         │            │
//!          │                      inline       queue ──▶ worker
//!          ▼                         ▼            ▼
//!     ┌──────────┐   ┌─────────────────────────────────┐
//!     │ job lock │──▶│ run: indexing → embedding → review │
//!     └──────────┘   └──────┬────────────┬──────────────┘
//!                           │            │
//!                 ┌─────────┴──┐   ┌─────┴──────┐
//!                 │ GitHub API │   │ Embeddings │
//!                 └────────────┘   └────────────┘
//!                           │
//!               ┌───────────┴───────────┐
//!               ▼                       ▼
//!          ┌─────────┐            ┌──────────┐
//!          │ SQLite  │            │ S3 / dir │
//!          │ rows    │            │ blobs    │
//!          └─────────┘            └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`models`] | Core data types |
//! | [`error`] | Tagged pipeline errors |
//! | [`retry`] | Exponential-backoff retrier |
//! | [`chunk`] | Overlapping character-window chunker |
//! | [`embedding`] | Embedding backends and the retrying batcher |
//! | [`storage`] | Blob storage (S3 SigV4, local directory) |
//! | [`github`] | GitHub REST client |
//! | [`store`] | Projects, file versions, chunks, commits |
//! | [`lock`] | Lease-based job locks |
//! | [`progress`] | Run state machine and progress reporting |
//! | [`reconcile`] | Change detection and per-file sync |
//! | [`ingest`] | Pipeline orchestration |
//! | [`webhook`] | Push webhooks |
//! | [`queue`] | Durable webhook job queue |
//! | [`analysis`] | AI analysis regeneration |
//! | [`retention`] | Invalidated-chunk sweep |
//! | [`server`] | HTTP server |

pub mod analysis;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod github;
pub mod ingest;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod retention;
pub mod retry;
pub mod server;
pub mod storage;
pub mod store;
pub mod traits;
pub mod webhook;

#[cfg(test)]
mod testutil;
