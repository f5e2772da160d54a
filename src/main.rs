use std::sync::Arc;

use agent_dispatch::api::{AppState, api_routes};
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::fanout::StreamManager;
use agent_dispatch::fanout::ws::worker_stream_routes;
use agent_dispatch::reaper::{LogNotifier, ReaperDeps, ReaperTelemetry, spawn_reaper_loop};
use agent_dispatch::registry::WorkerRegistry;
use agent_dispatch::store::{LibSqlStore, TaskStore};
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchConfig::from_env();

    let port: u16 = std::env::var("DISPATCH_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path = std::env::var("DISPATCH_DB_PATH")
        .unwrap_or_else(|_| "./data/agent-dispatch.db".to_string());

    eprintln!("🛰  Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", port);
    eprintln!("   Worker stream: ws://0.0.0.0:{}/ws/worker", port);
    eprintln!(
        "   Reaper: every {}s (stuck after {}s, max {} attempts)",
        config.reaper_interval.as_secs(),
        config.stuck_timeout.as_secs(),
        config.default_max_attempts,
    );
    eprintln!(
        "   Presence: workers live for {}s after last heartbeat",
        config.liveness_ttl.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path_ref = std::path::Path::new(&db_path);
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlStore::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}\n", db_path);

    // ── Engine state ─────────────────────────────────────────────────────
    let registry = Arc::new(WorkerRegistry::new(Arc::clone(&store), config.liveness_ttl));
    let streams = Arc::new(StreamManager::new());
    let telemetry = Arc::new(ReaperTelemetry::new());

    let state = AppState {
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        streams: Arc::clone(&streams),
        reaper: Arc::clone(&telemetry),
        config: config.clone(),
    };

    // ── Reaper ───────────────────────────────────────────────────────────
    let _reaper_handle = spawn_reaper_loop(
        ReaperDeps {
            store,
            registry,
            streams,
            telemetry,
            notifier: Arc::new(LogNotifier),
        },
        config,
    );

    // ── Server ───────────────────────────────────────────────────────────
    let app = api_routes(state.clone())
        .merge(worker_stream_routes(state))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Dispatch server started");
    axum::serve(listener, app).await?;

    Ok(())
}
