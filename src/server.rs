//! HTTP surface: webhook ingress, triggers, run polling and live progress.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/webhooks/github` | GitHub push deliveries (HMAC-signed) |
//! | `POST` | `/api/projects/{owner}/{repo}/rescan` | Start a full rescan, returns `{run_id}` |
//! | `POST` | `/api/cron/sanity-check` | Full reconciliation of every project |
//! | `POST` | `/api/cron/queue` | Drain one batch of queued webhook jobs |
//! | `POST` | `/api/cron/sweep` | Retention sweep of invalidated chunks |
//! | `GET`  | `/api/runs/{id}` | Run snapshot `{run, progress}` |
//! | `GET`  | `/api/runs/{id}/events` | Live progress as server-sent events |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Trigger endpoints require `Authorization: Bearer <CRON_SECRET>` or the
//! configured internal trigger header carrying the same secret.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "run abc not found" } }
//! ```
//!
//! Pipeline errors add `kind` and `context` from the
//! [`SyncError`](crate::error::SyncError).
//!
//! # Live progress
//!
//! The event stream emits `ready`, then `phase` and `counters` whenever they
//! change, and `done` once the run is terminal. It closes itself after
//! `server.stream_max_secs`; clients reconnect. Keep-alive comments are sent
//! every `server.stream_heartbeat_secs`.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::error::{ErrorKind, SyncError};
use crate::ingest::{run_sync, SyncOptions};
use crate::models::{RepoRef, RunPhase, RunStatus, ScanProgress, TriggerKind};
use crate::progress::{create_pending_run, load_run, load_snapshot, NoProgress};
use crate::queue::{drain_once, enqueue};
use crate::retention;
use crate::store;
use crate::webhook::{
    process_push, verify_github_signature, PushEvent, PushOutcome, DELIVERY_HEADER, EVENT_HEADER,
    SIGNATURE_HEADER, WEBHOOK_PATH,
};

#[derive(Clone)]
struct AppState {
    ctx: AppContext,
}

/// All routes with tracing and permissive CORS.
pub fn router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(WEBHOOK_PATH, post(handle_webhook))
        .route("/api/projects/{owner}/{repo}/rescan", post(handle_rescan))
        .route("/api/cron/sanity-check", post(handle_sanity_check))
        .route("/api/cron/queue", post(handle_drain_queue))
        .route("/api/cron/sweep", post(handle_sweep))
        .route("/api/runs/{id}", get(handle_get_run))
        .route("/api/runs/{id}/events", get(handle_run_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { ctx })
}

/// Bind `server.bind` and serve until Ctrl-C.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    if ctx.secrets.webhook_secret.is_none() {
        error!("GITHUB_WEBHOOK_SECRET is not set; every webhook delivery will be rejected");
    }
    if ctx.secrets.cron_secret.is_none() {
        warn!("CRON_SECRET is not set; trigger endpoints are unauthenticated");
    }

    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("docmirror server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Value>,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    sync: Option<SyncError>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            sync: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                kind: self.sync.as_ref().map(|e| e.kind),
                context: self.sync.as_ref().map(|e| json!(e.context)),
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match SyncError::find(&err) {
            Some(sync) => {
                let (status, code) = match sync.kind {
                    ErrorKind::LockContention => (StatusCode::CONFLICT, "lock_contention"),
                    ErrorKind::TransientExternal => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "sync_failed"),
                };
                AppError {
                    status,
                    code,
                    message: sync.message.clone(),
                    sync: Some(sync.clone()),
                }
            }
            None => {
                error!(error = %format!("{:#}", err), "request failed");
                internal("internal error")
            }
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

// ============ Auth ============

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Trigger endpoints: bearer `CRON_SECRET` or the internal trigger header.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(secret) = &state.ctx.secrets.cron_secret else {
        warn!("CRON_SECRET not configured; allowing trigger request");
        return Ok(());
    };
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let internal = headers
        .get(state.ctx.config.server.internal_trigger_header.as_str())
        .and_then(|v| v.to_str().ok());

    let ok = [bearer, internal]
        .into_iter()
        .flatten()
        .any(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()));
    if ok {
        Ok(())
    } else {
        Err(unauthorized("missing or invalid trigger credentials"))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /webhooks/github ============

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Some(secret) = &state.ctx.secrets.webhook_secret else {
        error!("webhook delivery rejected: GITHUB_WEBHOOK_SECRET is not configured");
        return Err(unauthorized("webhook secret not configured"));
    };
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify_github_signature(secret, &body, signature) {
        warn!("webhook delivery with invalid signature");
        return Err(unauthorized("invalid signature"));
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let delivery = headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if event != "push" {
        info!(event = %event, "webhook event acknowledged and ignored");
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored", "event": event }))).into_response());
    }

    let push = PushEvent::parse(&body).map_err(|e| bad_request(format!("{:#}", e)))?;

    let ctx = &state.ctx;
    if ctx.config.webhook.is_queued() {
        let payload = String::from_utf8_lossy(&body);
        let (job_id, created) = enqueue(
            &ctx.pool,
            &event,
            delivery.as_deref(),
            &payload,
            ctx.config.queue.max_retries,
        )
        .await?;
        info!(job_id = %job_id, delivery = ?delivery, created, "push queued");
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "job_id": job_id, "duplicate": !created })),
        )
            .into_response());
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        match process_push(&ctx, &push, Arc::new(NoProgress)).await {
            Ok(PushOutcome::Synced(report)) => info!(
                run_id = %report.run_id,
                updated = report.files_updated,
                removed = report.files_removed,
                "push synced"
            ),
            Ok(PushOutcome::Ignored(reason)) => info!(reason, "push ignored"),
            Err(e) => error!(delivery = ?delivery, error = %format!("{:#}", e), "push processing failed"),
        }
    });
    Ok((StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response())
}

// ============ Triggers ============

async fn handle_rescan(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let ctx = &state.ctx;
    let project = store::find_project(&ctx.pool, &RepoRef::new(&owner, &repo))
        .await?
        .ok_or_else(|| not_found(format!("project {}/{} not found", owner, repo)))?;

    let (run_id, created) = create_pending_run(
        &ctx.pool,
        &project.id,
        TriggerKind::Rescan,
        ctx.config.sync.lock_lease_secs,
    )
    .await?;
    if created {
        let ctx = ctx.clone();
        let run = run_id.clone();
        tokio::spawn(async move {
            let opts = SyncOptions::full(TriggerKind::Rescan).with_run_id(Some(run));
            if let Err(e) = run_sync(&ctx, &project, opts, Arc::new(NoProgress)).await {
                error!(project = %project.full_name(), error = %format!("{:#}", e), "rescan failed");
            }
        });
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "existing": !created })),
    )
        .into_response())
}

async fn handle_sanity_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let ctx = &state.ctx;

    let mut runs = Vec::new();
    let mut scheduled = Vec::new();
    for project in store::list_projects(&ctx.pool).await? {
        let (run_id, created) = create_pending_run(
            &ctx.pool,
            &project.id,
            TriggerKind::SanityCheck,
            ctx.config.sync.lock_lease_secs,
        )
        .await?;
        runs.push(json!({ "project": project.full_name(), "run_id": run_id, "existing": !created }));
        if created {
            scheduled.push((project, run_id));
        }
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        for (project, run_id) in scheduled {
            let opts = SyncOptions::full(TriggerKind::SanityCheck).with_run_id(Some(run_id));
            if let Err(e) = run_sync(&ctx, &project, opts, Arc::new(NoProgress)).await {
                error!(project = %project.full_name(), error = %format!("{:#}", e), "sanity check failed");
            }
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "runs": runs }))).into_response())
}

async fn handle_drain_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let stats = drain_once(&state.ctx, state.ctx.config.queue.batch_size).await?;
    Ok(Json(stats).into_response())
}

async fn handle_sweep(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    authorize(&state, &headers)?;
    let report = retention::sweep(&state.ctx.pool, &state.ctx.config.retention).await?;
    Ok(Json(report).into_response())
}

// ============ Runs ============

async fn handle_get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let snapshot = load_snapshot(&state.ctx.pool, &id)
        .await?
        .ok_or_else(|| not_found(format!("run {} not found", id)))?;
    Ok(Json(snapshot).into_response())
}

async fn handle_run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if load_run(&state.ctx.pool, &id).await?.is_none() {
        return Err(not_found(format!("run {} not found", id)));
    }
    let server = &state.ctx.config.server;
    let stream = run_event_stream(
        state.ctx.pool.clone(),
        id,
        Duration::from_millis(server.stream_poll_millis),
        Duration::from_secs(server.stream_max_secs),
    );
    Ok(Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(server.stream_heartbeat_secs))
                .text("keep-alive"),
        )
        .into_response())
}

struct StreamState {
    pool: SqlitePool,
    run_id: String,
    poll: Duration,
    deadline: Instant,
    queued: VecDeque<Event>,
    last_phase: Option<(RunPhase, RunStatus)>,
    last_counters: Option<ScanProgress>,
    polled: bool,
    finished: bool,
}

fn sse_event(name: &str, data: Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

/// Poll the run and turn changes into events, ending at a terminal status
/// or at `max_lifetime`.
fn run_event_stream(
    pool: SqlitePool,
    run_id: String,
    poll: Duration,
    max_lifetime: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut queued = VecDeque::new();
    queued.push_back(sse_event("ready", json!({ "run_id": run_id })));
    let state = StreamState {
        pool,
        run_id,
        poll,
        deadline: Instant::now() + max_lifetime,
        queued,
        last_phase: None,
        last_counters: None,
        polled: false,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queued.pop_front() {
                return Some((Ok(event), st));
            }
            if st.finished || Instant::now() >= st.deadline {
                return None;
            }
            if st.polled {
                let remaining = st.deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(st.poll.min(remaining)).await;
            }
            st.polled = true;
            poll_run(&mut st).await;
        }
    })
}

async fn poll_run(st: &mut StreamState) {
    let snapshot = match load_snapshot(&st.pool, &st.run_id).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            st.queued.push_back(sse_event("done", json!({ "status": "not_found" })));
            st.finished = true;
            return;
        }
        Err(e) => {
            warn!(run_id = %st.run_id, error = %e, "progress poll failed");
            return;
        }
    };

    let phase = (snapshot.run.phase, snapshot.run.status);
    if st.last_phase != Some(phase) {
        st.last_phase = Some(phase);
        st.queued.push_back(sse_event(
            "phase",
            json!({ "phase": phase.0, "status": phase.1 }),
        ));
    }
    let p = snapshot.progress;
    if st.last_counters != Some(p) {
        st.last_counters = Some(p);
        st.queued.push_back(sse_event(
            "counters",
            json!({
                "total": p.files_total,
                "indexed": p.files_indexed,
                "chunks": p.chunks,
                "review_done": p.review_done,
                "review_total": p.review_total,
            }),
        ));
    }
    if snapshot.run.status.is_terminal() {
        st.queued.push_back(sse_event("done", json!({ "status": snapshot.run.status })));
        st.finished = true;
    }
}
