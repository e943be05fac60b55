//! HTTP surface for the collector: init metadata and NDJSON collect streaming.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use gcsa_collect::{collect, init_metadata, CollectError, CollectRequest, CollectorConfig};
use gcsa_storage::GatewayFactory;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gcsa-web";

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub factory: Arc<dyn GatewayFactory>,
}

impl AppState {
    pub fn new(factory: Arc<dyn GatewayFactory>) -> Self {
        Self { factory }
    }
}

/// Errors raised before a collect stream starts. Rendered as
/// `{"error": {"type", "message", "key"?, "statusCode"}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Collect(#[from] CollectError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Collect(err) = &self;
        let status = StatusCode::BAD_REQUEST;
        warn!(error = %err, "collect request rejected");

        let mut body = json!({
            "error": {
                "type": err.error_type(),
                "message": err.to_string(),
                "statusCode": status.as_u16(),
            }
        });
        if let Some(key) = err.key() {
            body["error"]["key"] = json!(key);
        }
        (status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/collector/init", post(init_handler))
        .route("/collector/collect", post(collect_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = CollectorConfig::from_env();
    let state = AppState::new(config.gateway_factory());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "collector listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("collector shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c, shutting down");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn init_handler() -> Response {
    Json(init_metadata()).into_response()
}

async fn collect_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CollectRequest>,
) -> Result<Response, ApiError> {
    let envelopes = collect(request, state.factory.as_ref())?;
    let lines = envelopes.map(|envelope| {
        serde_json::to_vec(&envelope).map(|mut line| {
            line.push(b'\n');
            line
        })
    });
    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
}
