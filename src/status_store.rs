use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

/// Latest known telemetry for a single device.
///
/// Every field is updated independently by its own status topic, so a reader
/// can observe a snapshot where only part of a burst of messages has landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct DeviceStatus {
    pub health_check: bool,
    pub sprinkler_calib_complete: bool,
    pub valve_calib_complete: bool,
    pub valve_is_at_target: bool,
    pub task_all_complete: bool,
    pub sprinkler_position: f64,
    pub valve_position: f64,
    pub task_current_index: i64,
    pub task_current_count: i64,
    /// Raw task array exactly as reported by the device.
    pub task_array: String,
}

/// One field-level change decoded from an inbound status message.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    HealthCheck(bool),
    SprinklerPosition(f64),
    ValvePosition(f64),
    SprinklerCalibComplete(bool),
    ValveCalibComplete(bool),
    ValveIsAtTarget(bool),
    TaskCurrentIndex(i64),
    TaskCurrentCount(i64),
    TaskArray(String),
    TaskAllComplete(bool),
}

impl StatusUpdate {
    fn apply(self, status: &mut DeviceStatus) {
        match self {
            Self::HealthCheck(v) => status.health_check = v,
            Self::SprinklerPosition(v) => status.sprinkler_position = v,
            Self::ValvePosition(v) => status.valve_position = v,
            Self::SprinklerCalibComplete(v) => status.sprinkler_calib_complete = v,
            Self::ValveCalibComplete(v) => status.valve_calib_complete = v,
            Self::ValveIsAtTarget(v) => status.valve_is_at_target = v,
            Self::TaskCurrentIndex(v) => status.task_current_index = v,
            Self::TaskCurrentCount(v) => status.task_current_count = v,
            Self::TaskArray(v) => status.task_array = v,
            Self::TaskAllComplete(v) => status.task_all_complete = v,
        }
    }
}

/// In-memory store of the latest `DeviceStatus` per device ID.
///
/// Cloning is cheap and every clone shares the same map, so one instance is
/// handed to the MQTT dispatcher and the orchestration engine alike.
#[derive(Clone, Default)]
pub struct DeviceStatusStore {
    inner: Arc<RwLock<HashMap<String, DeviceStatus>>>,
}

impl DeviceStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the device's status. An unseen device gets a zero-valued
    /// entry created on the spot.
    pub async fn get(&self, device_id: &str) -> DeviceStatus {
        if let Some(status) = self.inner.read().await.get(device_id) {
            return status.clone();
        }
        self.inner
            .write()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .clone()
    }

    /// Replace the device's entry with a fresh zero-valued status.
    pub async fn reset(&self, device_id: &str) {
        self.inner
            .write()
            .await
            .insert(device_id.to_owned(), DeviceStatus::default());
    }

    /// Apply a single field update and return the resulting snapshot.
    pub async fn update(&self, device_id: &str, update: StatusUpdate) -> DeviceStatus {
        let mut guard = self.inner.write().await;
        let status = guard.entry(device_id.to_owned()).or_default();
        update.apply(status);
        status.clone()
    }
}
