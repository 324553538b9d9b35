//! Synapse Push - evaluation service
//!
//! Serves the bulk push rule evaluator over HTTP against an in-memory room
//! snapshot, for dry runs of rule changes.
//!
//! ## Configuration
//!
//! - `PUSH_CONFIG`: path to the TOML config (default: `config/push.toml`)
//! - `PUSH_API_KEY`: bearer token required on `/api` routes (overrides config)
//! - `RUST_LOG`: logging level

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use synapse_push::config::PushConfig;
use synapse_push::store::{AllowAll, MemoryStore};
use synapse_push::{evaluator_for_room_id, ActionsByUser, BaseRules, RoomEvent};

/// Application metrics
struct Metrics {
    evaluations: AtomicU64,
    notified_users: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            evaluations: AtomicU64::new(0),
            notified_users: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn record(&self, notified: usize) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.notified_users.fetch_add(notified as u64, Ordering::Relaxed);
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

struct AppState {
    store: Arc<MemoryStore>,
    base_rules: BaseRules,
    api_key: String,
    metrics: Metrics,
}

/// Response returned for an evaluated event.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationResponse {
    room_id: String,
    event_id: String,
    /// Users to notify and how; absent users are not notified
    actions: ActionsByUser,
    correlation_id: String,
    /// RFC 3339 time of evaluation
    evaluated_at: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Load Configuration
    let config = PushConfig::load()?;
    let api_key = env::var("PUSH_API_KEY")
        .ok()
        .or_else(|| config.server.api_key.clone())
        .unwrap_or_else(|| {
            warn!("PUSH_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });

    // 3. Seed the Store
    let store = if FsPath::new(&config.store.snapshot).exists() {
        MemoryStore::from_file(&config.store.snapshot)?
    } else {
        warn!(
            path = %config.store.snapshot,
            "Snapshot not found, starting with an empty store"
        );
        MemoryStore::default()
    }
    .with_state_history(config.store.state_history);

    let state = Arc::new(AppState {
        store: Arc::new(store),
        base_rules: config.base_rules(),
        api_key,
        metrics: Metrics::new(),
    });

    // 4. Start Server
    let app = build_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!("Synapse Push listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/rooms/:room_id/evaluate", post(evaluate_event))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "evaluations": state.metrics.evaluations.load(Ordering::Relaxed),
        "notified_users": state.metrics.notified_users.load(Ordering::Relaxed),
        "base_rules": state.base_rules.len(),
        "status": "running"
    }))
}

async fn evaluate_event(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(event): Json<RoomEvent>,
) -> Result<Json<EvaluationResponse>, StatusCode> {
    if event.room_id != room_id {
        warn!(
            path_room = %room_id,
            event_room = %event.room_id,
            "Event posted to the wrong room"
        );
        return Err(StatusCode::BAD_REQUEST);
    }

    // Extract or generate correlation ID
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    debug!(
        correlation_id = %correlation_id,
        event_id = %event.event_id,
        "Received event"
    );

    state.store.persist_event(&event).await;

    let evaluator = evaluator_for_room_id(&room_id, state.store.clone(), &state.base_rules)
        .await
        .map_err(|e| {
            error!(correlation_id = %correlation_id, "Failed to load push rules: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let actions = evaluator
        .action_for_event_by_user(&event, &AllowAll)
        .await
        .map_err(|e| {
            error!(correlation_id = %correlation_id, "Push rule evaluation failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state.metrics.record(actions.len());

    info!(
        room_id = %room_id,
        event_id = %event.event_id,
        notified = actions.len(),
        correlation_id = %correlation_id,
        "Event evaluated"
    );

    Ok(Json(EvaluationResponse {
        room_id,
        event_id: event.event_id,
        actions,
        correlation_id,
        evaluated_at: Utc::now().to_rfc3339(),
    }))
}
