use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::status_store::DeviceStatus;

/// Body of `POST /api/v1/trigger-task`. Omit `deviceId` to run every device.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTaskRequest {
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTaskResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceInfo {
    /// Value of `APP_ENV`.
    pub environment: String,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceStatusDto {
    pub device_id: String,
    pub status: DeviceStatus,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryParams {
    /// Maximum number of records, newest first (default 50, max 500).
    pub limit: Option<i64>,
}
