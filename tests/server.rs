//! HTTP surface tests: a live server on a free port with in-memory collaborators.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::{doc, harness, Harness, CRON_SECRET, HTML_URL, WEBHOOK_SECRET};
use doc_mirror::ingest::import_project;
use doc_mirror::models::TriggerKind;
use doc_mirror::progress::{create_pending_run, NoProgress};
use doc_mirror::queue::queue_stats;
use doc_mirror::server::run_server;
use doc_mirror::webhook::sign_payload;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct Served {
    h: Harness,
    base: String,
    client: reqwest::Client,
}

async fn serve(extra_toml: &str) -> Served {
    let port = find_free_port();
    let h = harness(
        &format!("[server]\nbind = \"127.0.0.1:{}\"\n{}", port, extra_toml),
        0,
    )
    .await;
    let ctx = h.ctx.clone();
    tokio::spawn(async move {
        run_server(ctx).await.unwrap();
    });
    wait_for_server(port).await;
    Served {
        h,
        base: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::new(),
    }
}

impl Served {
    async fn deliver(&self, event: &str, delivery: &str, body: &[u8], signature: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/webhooks/github", self.base))
            .header("x-github-event", event)
            .header("x-github-delivery", delivery)
            .header("x-hub-signature-256", signature)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .unwrap()
    }
}

fn push_body() -> Vec<u8> {
    json!({
        "ref": "refs/heads/main",
        "before": "1111111111111111111111111111111111111111",
        "after": "2222222222222222222222222222222222222222",
        "repository": {
            "name": "handbook",
            "full_name": "acme/handbook",
            "html_url": HTML_URL,
        },
        "commits": [{
            "id": "abc123",
            "message": "docs: update",
            "timestamp": "2026-01-02T03:04:05Z",
            "added": [],
            "modified": ["README.md"],
            "removed": [],
        }],
    })
    .to_string()
    .into_bytes()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_version() {
    let s = serve("").await;
    let body: Value = s
        .client
        .get(format!("{}/health", s.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn webhook_rejects_bad_signature() {
    let s = serve("").await;
    let body = push_body();

    let resp = s.deliver("push", "d-1", &body, "sha256=deadbeef").await;
    assert_eq!(resp.status(), 401);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "unauthorized");

    let resp = s
        .deliver("push", "d-1", &body, &sign_payload("wrong-secret", &body))
        .await;
    assert_eq!(resp.status(), 401);
    assert_eq!(queue_stats(s.h.pool()).await.unwrap().pending, 0);
}

#[tokio::test]
async fn webhook_acknowledges_other_events() {
    let s = serve("").await;
    let body = br#"{"zen":"Keep it logically awesome."}"#;
    let resp = s
        .deliver("ping", "d-ping", body, &sign_payload(WEBHOOK_SECRET, body))
        .await;
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["status"], "ignored");
    assert_eq!(ack["event"], "ping");
}

#[tokio::test]
async fn webhook_rejects_malformed_push() {
    let s = serve("").await;
    let body = br#"{"ref": 42}"#;
    let resp = s
        .deliver("push", "d-bad", body, &sign_payload(WEBHOOK_SECRET, body))
        .await;
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "bad_request");
}

#[tokio::test]
async fn webhook_queues_push_once_per_delivery() {
    let s = serve("").await;
    let body = push_body();
    let signature = sign_payload(WEBHOOK_SECRET, &body);

    let resp = s.deliver("push", "d-42", &body, &signature).await;
    assert_eq!(resp.status(), 202);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["status"], "queued");
    assert_eq!(first["duplicate"], false);

    let resp = s.deliver("push", "d-42", &body, &signature).await;
    assert_eq!(resp.status(), 202);
    let second: Value = resp.json().await.unwrap();
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["job_id"], first["job_id"]);

    assert_eq!(queue_stats(s.h.pool()).await.unwrap().pending, 1);
}

#[tokio::test]
async fn trigger_endpoints_require_cron_secret() {
    let s = serve("").await;
    let url = format!("{}/api/cron/queue", s.base);

    let resp = s.client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = s.client.post(&url).bearer_auth("nope").send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = s.client.post(&url).bearer_auth(CRON_SECRET).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let stats: Value = resp.json().await.unwrap();
    assert_eq!(stats["claimed"], 0);

    let resp = s
        .client
        .post(format!("{}/api/cron/sweep", s.base))
        .header("x-internal-trigger", CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sweep: Value = resp.json().await.unwrap();
    assert_eq!(sweep["chunks_deleted"], 0);
}

#[tokio::test]
async fn rescan_returns_run_and_runs_are_queryable() {
    let s = serve("").await;
    s.h.host.put("README.md", &doc("readme", 150));
    let (_, report) = import_project(&s.h.ctx, &s.h.repo(), Arc::new(NoProgress))
        .await
        .unwrap();

    let resp = s
        .client
        .post(format!("{}/api/projects/acme/missing/rescan", s.base))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = s
        .client
        .post(format!("{}/api/projects/acme/handbook/rescan", s.base))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    assert!(accepted["run_id"].as_str().is_some_and(|id| !id.is_empty()));

    let resp = s
        .client
        .get(format!("{}/api/runs/{}", s.base, report.run_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let snapshot: Value = resp.json().await.unwrap();
    assert_eq!(snapshot["run"]["status"], "completed");
    assert_eq!(snapshot["run"]["trigger"], "import");
    assert_eq!(snapshot["progress"]["files_indexed"], 1);
    assert_eq!(snapshot["progress"]["chunks"], 2);

    let resp = s
        .client
        .get(format!("{}/api/runs/no-such-run", s.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_found");
}

#[tokio::test]
async fn run_events_stream_ends_with_done() {
    let s = serve("").await;
    s.h.host.put("README.md", &doc("readme", 90));
    let (_, report) = import_project(&s.h.ctx, &s.h.repo(), Arc::new(NoProgress))
        .await
        .unwrap();

    let text = s
        .client
        .get(format!("{}/api/runs/{}/events", s.base, report.run_id))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("event: ready"));
    assert!(text.contains("event: done"));
    assert!(text.contains("completed"));
}

#[tokio::test]
async fn run_events_stream_follows_live_run_and_times_out() {
    let s = serve("stream_max_secs = 1\nstream_poll_millis = 50\n").await;
    s.h.host.put("README.md", &doc("readme", 90));
    let (project, _) = import_project(&s.h.ctx, &s.h.repo(), Arc::new(NoProgress))
        .await
        .unwrap();
    let (run_id, created) = create_pending_run(s.h.pool(), &project.id, TriggerKind::Rescan, 600)
        .await
        .unwrap();
    assert!(created);

    let pool = s.h.pool().clone();
    let advanced = run_id.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        sqlx::query("UPDATE ingestion_runs SET status = 'running', phase = 'embedding' WHERE id = ?")
            .bind(&advanced)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE scan_progress SET files_total = 3, files_indexed = 2, chunks = 5 WHERE run_id = ?")
            .bind(&advanced)
            .execute(&pool)
            .await
            .unwrap();
    });

    let started = std::time::Instant::now();
    let text = s
        .client
        .get(format!("{}/api/runs/{}/events", s.base, run_id))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    writer.await.unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(text.contains("event: ready"));
    assert!(text.contains("event: phase"));
    assert!(text.contains(r#""phase":"indexing""#));
    assert!(text.contains(r#""phase":"embedding""#));
    assert!(text.contains("event: counters"));
    assert!(text.contains(r#""indexed":2"#));
    assert!(!text.contains("event: done"));
}
