//! Local API server module
//!
//! Exposes the workflow engine over HTTP so a dashboard can start runs, follow
//! their progress and abort them.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::workflow::{WorkflowEngine, WorkflowState};

// ============ API State ============

pub struct ApiState {
    pub engine: Arc<WorkflowEngine>,
}

// ============ API Endpoints ============

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    accepted: bool,
    config: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct AbortResponse {
    aborted: bool,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn workflow_state(State(state): State<Arc<ApiState>>) -> Json<WorkflowState> {
    Json(state.engine.state())
}

async fn start_run(
    State(state): State<Arc<ApiState>>,
    Path(config): Path<String>,
) -> (StatusCode, Json<RunResponse>) {
    match state.engine.start(&config) {
        Ok(_) => {
            info!("Started workflow for {} via API", config);
            (
                StatusCode::ACCEPTED,
                Json(RunResponse {
                    accepted: true,
                    config,
                    message: "workflow started".to_string(),
                }),
            )
        }
        Err(e) => {
            warn!("Workflow for {} not started: {}", config, e);
            (
                StatusCode::CONFLICT,
                Json(RunResponse {
                    accepted: false,
                    config,
                    message: "workflow already running".to_string(),
                }),
            )
        }
    }
}

async fn abort_run(State(state): State<Arc<ApiState>>) -> Json<AbortResponse> {
    Json(AbortResponse {
        aborted: state.engine.abort(),
    })
}

// ============ Router ============

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflow", get(workflow_state))
        .route("/workflow/abort", post(abort_run))
        .route("/workflow/{config}/run", post(start_run))
        .with_state(state)
}

// ============ Server ============

pub async fn start_api_server(engine: Arc<WorkflowEngine>, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(ApiState { engine });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Local API server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
