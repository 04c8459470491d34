pub mod dto;
pub mod errors;
pub mod handlers;
pub mod slack_events;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use handlers::ApiDoc;

use crate::{db::HistoryQuery, engine::Engine, status_store::DeviceStatusStore};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: DeviceStatusStore,
    pub history: Arc<dyn HistoryQuery>,
    /// Empty disables Slack request verification.
    pub signing_secret: String,
    pub app_env: String,
}

impl AppState {
    pub fn verifies_slack_requests(&self) -> bool {
        !self.signing_secret.is_empty()
    }
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/", get(handlers::root))
        .route("/api/v1/trigger-task", post(handlers::trigger_task))
        .route("/devices/{device_id}/status", get(handlers::device_status))
        .route("/history", get(handlers::history))
        .route("/slack/events", post(slack_events::slack_events))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
        .layer(CorsLayer::permissive())
}
