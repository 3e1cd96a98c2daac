//! # doc-mirror CLI (`docmirror`)
//!
//! ## Usage
//!
//! ```bash
//! docmirror --config ./config/docmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docmirror init` | Create the SQLite database and run schema migrations |
//! | `docmirror import <owner/repo>` | Register a repository and run its first sync |
//! | `docmirror rescan <owner/repo>` | Full reconciliation of one repository |
//! | `docmirror sanity-check` | Full reconciliation of every repository |
//! | `docmirror worker` | Drain the webhook job queue |
//! | `docmirror sweep` | Delete old invalidated chunks |
//! | `docmirror status [owner/repo]` | Show projects, runs, locks and queue |
//! | `docmirror hook install|list|remove <owner/repo>` | Manage the push webhook |
//! | `docmirror serve` | Start the HTTP server |
//!
//! Secrets come from the environment: `GITHUB_TOKEN`, `OPENAI_API_KEY`,
//! `AWS_*`, `GITHUB_WEBHOOK_SECRET`, `CRON_SECRET`, `ANALYSIS_TOKEN`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use doc_mirror::config::{self, Secrets};
use doc_mirror::context::AppContext;
use doc_mirror::ingest::{self, SyncOptions};
use doc_mirror::lock::repo_lock_name;
use doc_mirror::logging::{self, LogFormat};
use doc_mirror::migrate;
use doc_mirror::models::{Project, RepoRef, TriggerKind};
use doc_mirror::progress::{format_number, latest_runs, ProgressMode, SyncProgressReporter};
use doc_mirror::queue;
use doc_mirror::retention;
use doc_mirror::server;
use doc_mirror::store;
use doc_mirror::webhook;

/// doc-mirror: mirror a repository's documentation into a versioned,
/// embedded knowledge base and keep it in sync.
#[derive(Parser)]
#[command(name = "docmirror", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docmirror.toml")]
    config: PathBuf,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Register a repository and run its first full sync.
    Import {
        /// `owner/repo` or a repository URL.
        repo: String,

        /// Progress on stderr. Defaults to `human` on a TTY, otherwise `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Reconcile one repository against its default branch.
    Rescan {
        repo: String,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Reconcile every tracked repository.
    SanityCheck {
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Process queued webhook jobs.
    Worker {
        /// Drain one batch and exit.
        #[arg(long)]
        once: bool,
    },

    /// Delete chunks invalidated longer ago than `retention.chunk_days`.
    Sweep,

    /// Show projects, recent runs, locks and the job queue.
    Status { repo: Option<String> },

    /// Manage the push webhook on a repository.
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum HookAction {
    Install { repo: String },
    List { repo: String },
    Remove { repo: String },
}

fn reporter(mode: Option<ProgressMode>) -> Arc<dyn SyncProgressReporter> {
    mode.unwrap_or_else(ProgressMode::default_for_tty).reporter()
}

async fn require_project(ctx: &AppContext, repo: &str) -> Result<Project> {
    let repo: RepoRef = repo.parse()?;
    match store::find_project(&ctx.pool, &repo).await? {
        Some(p) => Ok(p),
        None => bail!("{} is not tracked; run `docmirror import {}` first", repo, repo),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let ctx = AppContext::build(cfg, Secrets::from_env()).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Import { repo, progress } => {
            let repo: RepoRef = repo.parse()?;
            let (project, report) = ingest::import_project(&ctx, &repo, reporter(progress)).await?;
            report.print(&project.full_name());
        }
        Commands::Rescan { repo, progress } => {
            let project = require_project(&ctx, &repo).await?;
            let report = ingest::run_sync(
                &ctx,
                &project,
                SyncOptions::full(TriggerKind::Rescan),
                reporter(progress),
            )
            .await?;
            report.print(&project.full_name());
        }
        Commands::SanityCheck { progress } => {
            let results = ingest::sanity_check_all(&ctx, reporter(progress)).await?;
            let mut failed = 0;
            for (project, result) in &results {
                match result {
                    Ok(report) => report.print(&project.full_name()),
                    Err(e) => {
                        failed += 1;
                        println!("sync {}\n  error: {:#}", project.full_name(), e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} projects failed", failed, results.len());
            }
        }
        Commands::Worker { once } => {
            if once {
                let stats = queue::drain_once(&ctx, ctx.config.queue.batch_size).await?;
                println!("queue");
                println!("  claimed: {}", stats.claimed);
                println!("  done: {}", stats.done);
                println!("  retried: {}", stats.retried);
                println!("  exhausted: {}", stats.exhausted);
            } else {
                let shutdown = CancellationToken::new();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutdown requested");
                    token.cancel();
                });
                let interval = Duration::from_secs(ctx.config.queue.poll_secs);
                queue::run_worker(&ctx, interval, shutdown).await?;
            }
        }
        Commands::Sweep => {
            let report = retention::sweep(&ctx.pool, &ctx.config.retention).await?;
            println!("sweep");
            println!("  chunks deleted: {}", format_number(report.chunks_deleted));
            println!("ok");
        }
        Commands::Status { repo } => {
            let projects = match repo {
                Some(r) => vec![require_project(&ctx, &r).await?],
                None => store::list_projects(&ctx.pool).await?,
            };
            print_status(&ctx, &projects).await?;
        }
        Commands::Hook { action } => match action {
            HookAction::Install { repo } => {
                let hook = webhook::install_hook(&ctx, &repo.parse()?).await?;
                println!("hook {} -> {} (active: {})", hook.id, hook.url, hook.active);
            }
            HookAction::List { repo } => {
                let hooks = webhook::list_hooks(&ctx, &repo.parse()?).await?;
                if hooks.is_empty() {
                    println!("No hooks installed.");
                }
                for hook in hooks {
                    println!("{}  {}  [{}]  active={}", hook.id, hook.url, hook.events.join(","), hook.active);
                }
            }
            HookAction::Remove { repo } => {
                let removed = webhook::remove_hook(&ctx, &repo.parse()?).await?;
                println!("removed {} hook(s)", removed);
            }
        },
        Commands::Serve => {
            server::run_server(ctx.clone()).await?;
        }
    }

    ctx.pool.close().await;
    Ok(())
}

async fn print_status(ctx: &AppContext, projects: &[Project]) -> Result<()> {
    if projects.is_empty() {
        println!("No projects tracked.");
    }
    for project in projects {
        let stats = store::project_stats(&ctx.pool, &project.id).await?;
        println!("{} ({})", project.full_name(), project.default_branch);
        println!("  files: {} current, {} versions", stats.current_files, stats.file_versions);
        println!(
            "  chunks: {} current ({} embedded), {} invalidated",
            format_number(stats.current_chunks.max(0) as u64),
            format_number(stats.embedded_chunks.max(0) as u64),
            format_number(stats.invalidated_chunks.max(0) as u64)
        );
        println!("  commits: {}", stats.commits);
        if let Some(ts) = stats.last_analysis_at {
            println!("  last analysis: {}", format_ts(ts));
        }
        if let Some((lock, state)) = ctx.locks.inspect(&repo_lock_name(&project.repo_ref())).await? {
            println!("  lock: {:?} by {} until {}", state, lock.holder, format_ts(lock.expires_at));
        }
        for run in latest_runs(&ctx.pool, &project.id, 5).await? {
            println!(
                "  run {}  {}  {}/{}  {}",
                run.id,
                run.trigger,
                run.status,
                run.phase,
                format_ts(run.created_at)
            );
        }
    }

    let q = queue::queue_stats(&ctx.pool).await?;
    println!(
        "queue: {} pending, {} running, {} done, {} error",
        q.pending, q.running, q.done, q.error
    );
    Ok(())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
