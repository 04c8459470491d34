use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info};
use utoipa::OpenApi;

use super::{
    dto::{DeviceStatusDto, HistoryParams, ServiceInfo, TriggerTaskRequest, TriggerTaskResponse},
    errors::AppError,
    slack_events, AppState,
};
use crate::{
    db::models::{JobRecord, JobStatus},
    status_store::DeviceStatus,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Start a run for one device, or for all devices when `deviceId` is omitted.
///
/// Returns as soon as the run is queued; results arrive as notifications and
/// history records.
#[utoipa::path(
    post,
    path = "/api/v1/trigger-task",
    request_body(content = TriggerTaskRequest, description = "Optional target device"),
    responses(
        (status = 202, description = "Run started", body = TriggerTaskResponse),
        (status = 400, description = "Malformed request body"),
        (status = 404, description = "Unknown device"),
    ),
    tag = "jobs"
)]
pub async fn trigger_task(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerTaskResponse>), AppError> {
    let request: TriggerTaskRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerTaskRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid request body: {e}")))?
    };

    let engine = state.engine.clone();
    let response = match request.device_id.filter(|id| !id.is_empty()) {
        Some(device_id) => {
            if engine.device(&device_id).is_none() {
                return Err(AppError::NotFound(format!("device {device_id} not found")));
            }
            info!(device_id = %device_id, "Manual run requested");
            let id = device_id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run_for_device(&id).await {
                    error!(device_id = %id, error = %e, "Manual device run failed");
                }
            });
            TriggerTaskResponse {
                message: format!("Task triggered for device {device_id}"),
                device_id: Some(device_id),
            }
        }
        None => {
            info!("Manual run requested for all devices");
            tokio::spawn(async move {
                engine.run_all_once().await;
            });
            TriggerTaskResponse {
                message: "Task triggered for all devices".into(),
                device_id: None,
            }
        }
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Latest status snapshot reported by a configured device.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/status",
    params(
        ("device_id" = String, Path, description = "Configured device ID"),
    ),
    responses(
        (status = 200, description = "Current status", body = DeviceStatusDto),
        (status = 404, description = "Unknown device"),
    ),
    tag = "devices"
)]
pub async fn device_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStatusDto>, AppError> {
    if state.engine.device(&device_id).is_none() {
        return Err(AppError::NotFound(format!("device {device_id} not found")));
    }
    let status = state.store.get(&device_id).await;
    Ok(Json(DeviceStatusDto { device_id, status }))
}

/// Most recent job history records, newest first.
#[utoipa::path(
    get,
    path = "/history",
    params(HistoryParams),
    responses(
        (status = 200, description = "Job history", body = Vec<JobRecord>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "jobs"
)]
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<JobRecord>>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.history.recent(limit).await?))
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service environment", body = ServiceInfo),
    ),
    tag = "system"
)]
pub async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        environment: state.app_env.clone(),
        status: "ok".into(),
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(trigger_task, device_status, history, root, health, slack_events::slack_events),
    components(schemas(
        TriggerTaskRequest,
        TriggerTaskResponse,
        DeviceStatusDto,
        DeviceStatus,
        ServiceInfo,
        JobRecord,
        JobStatus
    )),
    tags(
        (name = "jobs",    description = "Run triggers and job history"),
        (name = "devices", description = "Live device status"),
        (name = "slack",   description = "Slack Events API callbacks"),
        (name = "system",  description = "System endpoints"),
    ),
    info(
        title = "Irrigation Orchestrator API",
        version = "0.1.0",
        description = "Trigger and inspect irrigation device jobs"
    )
)]
pub struct ApiDoc;
