//! JSON surface for CWS: `POST /sync` accepts a run request and returns the
//! run outcome, `GET /healthz` answers liveness probes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cws_sync::{run_sync_once_from_env, SyncRequest, SyncResponse};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "cws-web";

/// Seam between the HTTP layer and the sync pipeline. The production runner
/// wires the warehouse and Postgres from the environment per request; tests
/// substitute a canned runner.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run_sync(&self, request: SyncRequest) -> anyhow::Result<SyncResponse>;
}

pub struct EnvSyncRunner;

#[async_trait]
impl SyncRunner for EnvSyncRunner {
    async fn run_sync(&self, request: SyncRequest) -> anyhow::Result<SyncResponse> {
        run_sync_once_from_env(&request).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn SyncRunner>,
}

impl AppState {
    pub fn new(runner: Arc<dyn SyncRunner>) -> Self {
        Self { runner }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CWS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let state = AppState::new(Arc::new(EnvSyncRunner));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    if request.tenant_id.trim().is_empty() {
        let body = json!({"success": false, "error": "tenant_id is required"});
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    match state.runner.run_sync(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            error!(%err, "sync run could not start");
            let body = json!({"success": false, "error": err.to_string()});
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}
