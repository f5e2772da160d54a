//! Integration tests for the dispatch REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port, drives the REST API
//! with reqwest and the worker stream with tokio-tungstenite, and exercises
//! the real claim/release/reaper contract.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use agent_dispatch::api::{AppState, api_routes};
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::fanout::StreamManager;
use agent_dispatch::fanout::ws::worker_stream_routes;
use agent_dispatch::reaper::{LogNotifier, ReaperDeps, ReaperTelemetry, run_reaper_cycle};
use agent_dispatch::registry::WorkerRegistry;
use agent_dispatch::store::{LibSqlStore, TaskStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start an Axum server on a random port, return (port, state).
async fn start_server() -> (u16, AppState) {
    let config = DispatchConfig::default();
    let store: Arc<dyn TaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let registry = Arc::new(WorkerRegistry::new(Arc::clone(&store), config.liveness_ttl));

    let state = AppState {
        store,
        registry,
        streams: Arc::new(StreamManager::new()),
        reaper: Arc::new(ReaperTelemetry::new()),
        config,
    };

    let app = api_routes(state.clone()).merge(worker_stream_routes(state.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, state)
}

/// Reaper deps sharing the server's state, so tests can drive cycles.
fn reaper_deps(state: &AppState) -> ReaperDeps {
    ReaperDeps {
        store: Arc::clone(&state.store),
        registry: Arc::clone(&state.registry),
        streams: Arc::clone(&state.streams),
        telemetry: Arc::clone(&state.reaper),
        notifier: Arc::new(LogNotifier),
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Register a worker over REST.
async fn register_worker(port: u16, worker_id: &str, codebases: &[&str], capabilities: &[&str]) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/workers/register"))
        .json(&json!({
            "worker_id": worker_id,
            "role": "builder",
            "owned_codebases": codebases,
            "capabilities": capabilities,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

/// Create a task over REST, returning its id.
async fn create_task(port: u16, body: Value) -> String {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/tasks"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let task: Value = resp.json().await.unwrap();
    task["id"].as_str().unwrap().to_string()
}

/// Fetch a task over REST.
async fn get_task(port: u16, id: &str) -> Value {
    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/tasks/{id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

/// Open a worker stream and consume the `registered` ack.
async fn connect_worker_stream(
    port: u16,
    worker_id: &str,
    codebases: &[&str],
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/worker"))
        .await
        .expect("WS connect failed");

    let register = json!({
        "action": "register",
        "worker_id": worker_id,
        "role": "builder",
        "owned_codebases": codebases,
        "capabilities": [],
    });
    ws.send(Message::Text(register.to_string().into()))
        .await
        .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    let ack = parse_ws_json(&ack);
    assert_eq!(ack["type"], "registered");
    assert_eq!(ack["worker_id"], worker_id);

    ws
}

// ── REST tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connected_workers"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn created_task_exposes_full_field_set() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        let id = create_task(
            port,
            json!({
                "scope": "codebase:repo1",
                "target_role": "builder",
                "required_capabilities": ["git"],
                "priority": 5,
                "payload": {"kind": "build", "ref": "main"},
            }),
        )
        .await;

        let task = get_task(port, &id).await;
        assert_eq!(task["status"], "pending");
        assert_eq!(task["scope"], "codebase:repo1");
        assert_eq!(task["target_role"], "builder");
        assert_eq!(task["priority"], 5);
        assert_eq!(task["attempts"], 0);
        assert_eq!(task["max_attempts"], 3);
        assert_eq!(task["payload"]["kind"], "build");
        assert!(task.get("claimed_by").is_none() || task["claimed_by"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn claim_poll_returns_no_content_when_empty() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        register_worker(port, "w1", &[], &[]).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/workers/w1/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn claim_release_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        register_worker(port, "w1", &[], &[]).await;

        let id = create_task(port, json!({"scope": "global", "payload": {"n": 1}})).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w1/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let claimed: Value = resp.json().await.unwrap();
        assert_eq!(claimed["id"], id.as_str());
        assert_eq!(claimed["status"], "claimed");
        assert_eq!(claimed["claimed_by"], "w1");
        assert_eq!(claimed["attempts"], 1);

        // Start running, heartbeat, release.
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/tasks/{id}/progress"))
            .json(&json!({"worker_id": "w1", "status": "running"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/tasks/{id}/progress"))
            .json(&json!({"worker_id": "w1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/tasks/{id}/release"))
            .json(&json!({
                "worker_id": "w1",
                "status": "completed",
                "result": {"exit_code": 0},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let task = get_task(port, &id).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["result"]["exit_code"], 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn losing_a_named_claim_race_is_conflict() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        register_worker(port, "w1", &[], &[]).await;
        register_worker(port, "w2", &[], &[]).await;

        let id = create_task(port, json!({"scope": "global"})).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w1/claim/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w2/claim/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scope_isolation_over_the_wire() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        register_worker(port, "w1", &["repo1"], &[]).await;
        register_worker(port, "w2", &[], &[]).await;

        let id = create_task(port, json!({"scope": "codebase:repo1"})).await;

        let client = reqwest::Client::new();
        // The unscoped worker polls first and gets nothing.
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w2/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w1/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let claimed: Value = resp.json().await.unwrap();
        assert_eq!(claimed["id"], id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_is_idempotent_over_the_wire() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        let id = create_task(port, json!({"scope": "global"})).await;

        let client = reqwest::Client::new();
        for _ in 0..2 {
            let resp = client
                .post(format!("http://127.0.0.1:{port}/api/tasks/{id}/cancel"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let task: Value = resp.json().await.unwrap();
            assert_eq!(task["status"], "cancelled");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_worker_cannot_claim() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/workers/ghost/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

// ── WebSocket tests ──────────────────────────────────────────────────

#[tokio::test]
async fn connected_worker_receives_task_hint() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        let mut ws = connect_worker_stream(port, "w1", &["repo1"]).await;

        let id = create_task(port, json!({"scope": "codebase:repo1"})).await;

        let msg = ws.next().await.unwrap().unwrap();
        let hint = parse_ws_json(&msg);
        assert_eq!(hint["type"], "task_available");
        assert_eq!(hint["task_id"], id.as_str());
        assert_eq!(hint["scope"], "codebase:repo1");

        // The hint carries only id and scope — never the payload.
        assert!(hint.get("payload").is_none());

        // Advisory flip happened.
        let task = get_task(port, &id).await;
        assert_eq!(task["status"], "routed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ineligible_worker_receives_no_hint() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        let mut ws = connect_worker_stream(port, "w1", &[]).await;

        create_task(port, json!({"scope": "codebase:repo1"})).await;
        // Global task afterwards acts as a fence: the first frame the worker
        // sees must be for it, proving the scoped hint was never sent.
        let global_id = create_task(port, json!({"scope": "global"})).await;

        let msg = ws.next().await.unwrap().unwrap();
        let hint = parse_ws_json(&msg);
        assert_eq!(hint["type"], "task_available");
        assert_eq!(hint["task_id"], global_id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn late_worker_gets_initial_sync_hints() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;

        // Task exists before the worker ever connects.
        let id = create_task(port, json!({"scope": "global"})).await;

        let mut ws = connect_worker_stream(port, "w1", &[]).await;

        let msg = ws.next().await.unwrap().unwrap();
        let hint = parse_ws_json(&msg);
        assert_eq!(hint["type"], "task_available");
        assert_eq!(hint["task_id"], id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn hint_is_advisory_claim_still_decides() {
    timeout(TEST_TIMEOUT, async {
        let (port, _state) = start_server().await;
        register_worker(port, "fast", &[], &[]).await;

        let mut ws = connect_worker_stream(port, "slow", &[]).await;

        let id = create_task(port, json!({"scope": "global"})).await;

        // The slow worker receives the hint...
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(parse_ws_json(&msg)["type"], "task_available");

        // ...but a polling worker wins the claim first.
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/fast/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Acting on the stale hint is a conflict, not a system error.
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/slow/claim/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

// ── Reaper tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn zero_deadline_task_fails_within_one_cycle() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;

        let id = create_task(port, json!({"scope": "global", "deadline_seconds": 0})).await;

        run_reaper_cycle(&reaper_deps(&state), &state.config).await;

        let task = get_task(port, &id).await;
        assert_eq!(task["status"], "failed");
        assert_eq!(task["failure_reason"], "deadline_exceeded");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn crashed_worker_task_is_requeued_and_readvertised() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;
        register_worker(port, "w1", &[], &[]).await;

        let id = create_task(port, json!({"scope": "global"})).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w1/claim"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        client
            .post(format!("http://127.0.0.1:{port}/api/tasks/{id}/progress"))
            .json(&json!({"worker_id": "w1", "status": "running"}))
            .send()
            .await
            .unwrap();

        // A second worker watches the stream. The task is claimed right now,
        // so its initial sync carries no hints.
        let mut ws = connect_worker_stream(port, "w2", &[]).await;

        // w1 "crashes": no further heartbeats. Zero stuck timeout makes the
        // silence immediately visible to the reaper.
        let mut config = state.config.clone();
        config.stuck_timeout = Duration::from_secs(0);
        run_reaper_cycle(&reaper_deps(&state), &config).await;

        let task = get_task(port, &id).await;
        assert_eq!(task["status"], "routed"); // requeued, then re-advertised
        assert_eq!(task["attempts"], 2);
        assert!(task.get("claimed_by").is_none() || task["claimed_by"].is_null());

        // The watching worker got the re-advertised hint.
        let msg = ws.next().await.unwrap().unwrap();
        let hint = parse_ws_json(&msg);
        assert_eq!(hint["type"], "task_available");
        assert_eq!(hint["task_id"], id.as_str());

        // And can claim it.
        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workers/w2/claim/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reaper_endpoint_reports_stuck_tasks_and_telemetry() {
    timeout(TEST_TIMEOUT, async {
        let (port, state) = start_server().await;

        run_reaper_cycle(&reaper_deps(&state), &state.config).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/reaper"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert!(body["stuck"].as_array().unwrap().is_empty());
        assert_eq!(body["telemetry"]["cycles"], 1);
        assert_eq!(body["telemetry"]["is_scanning"], false);
    })
    .await
    .expect("test timed out");
}
