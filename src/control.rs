//! Control API for inspecting and driving the orchestrator by hand.
//!
//! Runs on the separate admin port.
//!
//! ## Endpoints
//!
//! | Method | Path                 | Description                                 |
//! |--------|----------------------|---------------------------------------------|
//! | GET    | `/control/status`    | Swap phase, active model, per-model state   |
//! | GET    | `/control/models`    | Installed models with metadata              |
//! | POST   | `/control/switch`    | Swap to a model                             |
//! | POST   | `/control/stop`      | Terminate the active backend                |
//! | GET    | `/control/resources` | Current free RAM / VRAM reading             |

use crate::middleware::status_for;
use crate::orchestrator::SwapOrchestrator;
use crate::resources::AvailableResources;
use crate::types::SwapPhase;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;

/// Build the control API router.
pub fn control_router(orchestrator: SwapOrchestrator) -> Router {
    Router::new()
        .route("/control/status", get(get_status))
        .route("/control/models", get(list_models))
        .route("/control/switch", post(switch_model))
        .route("/control/stop", post(stop_model))
        .route("/control/resources", get(get_resources))
        .with_state(orchestrator)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    phase: SwapPhase,
    active_model: Option<String>,
    services: Vec<ServiceStatus>,
}

#[derive(Serialize)]
struct ServiceStatus {
    model_id: String,
    active: bool,
    pid: Option<u32>,
    /// Seconds since the Unix epoch
    last_swap: Option<u64>,
}

#[derive(Serialize)]
struct ModelInfo {
    model_id: String,
    estimated_memory_gb: f64,
    memory_defaulted: bool,
    port: u16,
    aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
}

#[derive(Deserialize)]
struct SwitchRequest {
    model: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

type ControlError = (StatusCode, Json<ErrorResponse>);

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(orchestrator): State<SwapOrchestrator>) -> Json<StatusResponse> {
    let registry = orchestrator.registry();
    let services = registry
        .snapshot()
        .await
        .into_iter()
        .map(|state| ServiceStatus {
            model_id: state.descriptor.model_id.clone(),
            active: state.active,
            pid: state.pid,
            last_swap: state
                .last_swap_timestamp
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        })
        .collect();

    Json(StatusResponse {
        phase: orchestrator.phase(),
        active_model: registry.active_model(),
        services,
    })
}

async fn list_models(State(orchestrator): State<SwapOrchestrator>) -> Json<Vec<ModelInfo>> {
    let registry = orchestrator.registry();
    let models = registry
        .model_ids()
        .iter()
        .filter_map(|id| registry.descriptor(id))
        .map(|d| ModelInfo {
            model_id: d.model_id.clone(),
            estimated_memory_gb: d.estimated_memory_gb,
            memory_defaulted: d.memory_defaulted,
            port: d.port,
            aliases: d.aliases.clone(),
            task: d.task.clone(),
            backend: d.backend.clone(),
        })
        .collect();
    Json(models)
}

async fn switch_model(
    State(orchestrator): State<SwapOrchestrator>,
    Json(body): Json<SwitchRequest>,
) -> Result<Json<MessageResponse>, ControlError> {
    match orchestrator.switch_to(&body.model).await {
        Ok(()) => Ok(Json(MessageResponse {
            message: format!("Active model: {}", body.model),
        })),
        Err(e) => Err((
            status_for(&e),
            Json(ErrorResponse {
                error: e.to_string(),
                code: e.code(),
            }),
        )),
    }
}

async fn stop_model(
    State(orchestrator): State<SwapOrchestrator>,
) -> Result<Json<MessageResponse>, ControlError> {
    match orchestrator.stop_active().await {
        Ok(Some(model)) => Ok(Json(MessageResponse {
            message: format!("Stopped model: {}", model),
        })),
        Ok(None) => Ok(Json(MessageResponse {
            message: "No active model".to_string(),
        })),
        Err(e) => Err((
            status_for(&e),
            Json(ErrorResponse {
                error: e.to_string(),
                code: e.code(),
            }),
        )),
    }
}

async fn get_resources(State(orchestrator): State<SwapOrchestrator>) -> Json<AvailableResources> {
    Json(orchestrator.resources().available_resources().await)
}
