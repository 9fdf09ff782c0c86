use std::future::Future;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use powerwatch_core::{event, DecodeError, RelayHandle};

pub mod stream;

/// Static version string served by `/version`
pub const VERSION: &str = "v0.1.0";

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("invalid power event: {0}")]
    InvalidEvent(#[from] DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self {
            ServerError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(relay: RelayHandle, keep_alive: Duration) -> Self {
        Self { relay, keep_alive }
    }
}

/// All routes, with permissive CORS for the browser UI
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/version", get(version_handler))
        .route("/health", get(health_handler))
        .route("/power-events", post(ingest_handler))
        .route("/events", get(stream::event_stream_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves and every open connection has finished.
/// Open SSE streams only finish once the relay closes its subscriptions.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(target: "http", %addr, "Starting Powerwatch HTTP server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(target: "http", "HTTP server stopped");
    Ok(())
}

async fn version_handler() -> &'static str {
    VERSION
}

/// Liveness: 200 while the broker subscription is live, 503 otherwise
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.relay.status();
    let code = if status.broker_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "version": VERSION,
            "broker_connected": status.broker_connected,
            "subscribers": status.subscribers,
            "queue_depth": status.queue_depth,
        })),
    )
}

/// Fire-and-forget ingest path for the OS-side producer. Logs and acknowledges;
/// never touches the broker or connected clients.
async fn ingest_handler(body: Bytes) -> Result<StatusCode> {
    let event = event::decode(&body).map_err(|e| {
        warn!(target: "http", error = %e, payload = %event::preview(&body), "Rejected power event");
        e
    })?;
    info!(
        target: "http",
        received_at = %chrono::Utc::now(),
        state = %event.state(),
        time_generated = %event.time_generated(),
        "Power event received"
    );
    Ok(StatusCode::ACCEPTED)
}
