//! HTTP trigger surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Orchestrator state, last report, checkpoint, record count |
//! | `POST` | `/sync` | Run one sync cycle and return its report |
//! | `POST` | `/retrieve` | Ranked chunks (and optionally a context block) for a query |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "embedding_unavailable", "message": "..." } }
//! ```
//!
//! Pipeline errors use [`Error::code`]; request validation uses
//! `bad_request`.
//!
//! # Background sync
//!
//! With `[sync].interval_secs > 0` a cycle is triggered on that interval.
//! Triggers from the timer and from `POST /sync` coalesce in the
//! orchestrator. On shutdown (Ctrl-C) the in-flight cycle is cancelled
//! cooperatively before the server exits.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use notion_index_core::search::RetrievedChunk;
use notion_index_core::store::RecordFilter;
use notion_index_core::Error;

use crate::app::App;
use crate::retrieve::Retriever;
use crate::sync::{SyncOrchestrator, SyncReport, SyncState};

/// Shared state for all handlers.
pub struct ServerState {
    orchestrator: Arc<SyncOrchestrator>,
    retriever: Retriever,
    default_root: Option<String>,
    default_k: usize,
    shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        retriever: Retriever,
        default_root: Option<String>,
        default_k: usize,
    ) -> Self {
        Self {
            orchestrator,
            retriever,
            default_root,
            default_k,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled when the server begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/sync", post(handle_sync))
        .route("/retrieve", post(handle_retrieve))
        .layer(cors)
        .with_state(state)
}

/// Build the state from `app`, bind `[server].bind` and serve until Ctrl-C.
pub async fn run_server(app: &App) -> anyhow::Result<()> {
    let orchestrator = Arc::new(app.orchestrator().await?);
    let retriever = app.retriever().await?;
    let default_root = app.resolve_root(None).await.ok();
    let state = Arc::new(ServerState::new(
        orchestrator,
        retriever,
        default_root,
        app.config.retrieval.k,
    ));

    let interval = app.config.sync.interval_secs;
    if interval > 0 {
        spawn_interval_sync(state.clone(), Duration::from_secs(interval));
    }

    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, collection = %app.collection, "listening");
    println!("notion-index server listening on http://{}", bind_addr);

    let shutdown = state.shutdown_token();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, cancelling in-flight sync");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

fn spawn_interval_sync(state: Arc<ServerState>, every: Duration) {
    let Some(root) = state.default_root.clone() else {
        warn!("interval sync disabled: no resource root configured");
        return;
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cancel = state.shutdown.child_token();
            if let Err(e) = state.orchestrator.run_sync_with_cancel(&root, cancel).await {
                warn!(error = %e, "scheduled sync failed");
            }
        }
    });
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
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::SourceNotFound(_) => StatusCode::NOT_FOUND,
            Error::SourceRejected(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::SourceUnavailable(_) | Error::EmbeddingUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::EmbeddingDimensionMismatch { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
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

// ============ GET /status ============

#[derive(Serialize)]
struct CheckpointSummary {
    root_id: String,
    last_sync_completed_at: String,
    tracked_nodes: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    state: SyncState,
    collection: String,
    records: usize,
    checkpoint: Option<CheckpointSummary>,
    last_report: Option<SyncReport>,
}

async fn handle_status(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<StatusResponse>, AppError> {
    let orch = &state.orchestrator;
    let checkpoint = orch.checkpoints().load().await?.map(|cp| CheckpointSummary {
        root_id: cp.resource_root_id,
        last_sync_completed_at: cp.last_sync_completed_at.to_rfc3339(),
        tracked_nodes: cp.node_version_map.len(),
    });
    Ok(Json(StatusResponse {
        state: orch.state(),
        collection: orch.index().collection().to_string(),
        records: orch.index().count().await?,
        checkpoint,
        last_report: orch.last_report(),
    }))
}

// ============ POST /sync ============

#[derive(Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    root_id: Option<String>,
    /// Discard the checkpoint first.
    #[serde(default)]
    full: bool,
}

async fn handle_sync(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<SyncRequest>>,
) -> Result<Json<SyncReport>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let root = req
        .root_id
        .filter(|r| !r.trim().is_empty())
        .or_else(|| state.default_root.clone())
        .ok_or_else(|| bad_request("root_id is required (no default root configured)"))?;
    if req.full {
        state.orchestrator.reset_checkpoint().await?;
    }
    let report = state
        .orchestrator
        .run_sync_with_cancel(&root, state.shutdown.child_token())
        .await?;
    Ok(Json(report))
}

// ============ POST /retrieve ============

#[derive(Deserialize)]
struct RetrieveRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    /// Earlier conversation turns; searched with a lower weight.
    #[serde(default)]
    history: Vec<String>,
    /// Restrict hits to these source nodes.
    #[serde(default)]
    node_ids: Option<Vec<String>>,
    /// Also render a context block.
    #[serde(default)]
    context: bool,
}

#[derive(Serialize)]
struct RetrieveResponse {
    results: Vec<RetrievedChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
}

async fn handle_retrieve(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    if req.query.trim().is_empty() && req.history.is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let k = req.k.unwrap_or(state.default_k);
    let filter = req.node_ids.map(RecordFilter::for_nodes);

    let results = state
        .retriever
        .retrieve_with_history(&req.query, &req.history, k, filter.as_ref())
        .await?;
    let context = if req.context {
        Some(state.retriever.render(&results))
    } else {
        None
    };
    Ok(Json(RetrieveResponse { results, context }))
}
