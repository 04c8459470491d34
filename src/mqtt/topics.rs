use thiserror::Error;

use crate::status_store::StatusUpdate;

// ---------------------------------------------------------------------------
// Inbound status topics: <device_id>/status/<suffix>
// ---------------------------------------------------------------------------

const STATUS_SEGMENT: &str = "status";
const COMMAND_SEGMENT: &str = "cmd";

/// Every status topic a device publishes, one variant per `DeviceStatus` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTopic {
    HealthCheck,
    SprinklerPosition,
    ValvePosition,
    SprinklerCalibComplete,
    ValveCalibComplete,
    ValveIsAtTarget,
    TaskCurrentIndex,
    TaskCurrentCount,
    TaskArray,
    TaskAllComplete,
}

impl StatusTopic {
    pub const ALL: [StatusTopic; 10] = [
        Self::HealthCheck,
        Self::SprinklerPosition,
        Self::ValvePosition,
        Self::SprinklerCalibComplete,
        Self::ValveCalibComplete,
        Self::ValveIsAtTarget,
        Self::TaskCurrentIndex,
        Self::TaskCurrentCount,
        Self::TaskArray,
        Self::TaskAllComplete,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::SprinklerPosition => "sprinkler/position",
            Self::ValvePosition => "valve/position",
            Self::SprinklerCalibComplete => "sprinkler/calib_complete",
            Self::ValveCalibComplete => "valve/calib_complete",
            Self::ValveIsAtTarget => "valve/is_at_target",
            Self::TaskCurrentIndex => "task/current_index",
            Self::TaskCurrentCount => "task/current_count",
            Self::TaskArray => "task/array",
            Self::TaskAllComplete => "task/all_complete",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.suffix() == suffix)
    }

    /// Full topic for `device_id`, e.g. `sprinkler_01/status/valve/position`.
    pub fn topic(self, device_id: &str) -> String {
        format!("{device_id}/{STATUS_SEGMENT}/{}", self.suffix())
    }

    /// Decode `payload` into the field update this topic carries.
    pub fn decode(self, payload: &str) -> Result<StatusUpdate, PayloadError> {
        let update = match self {
            Self::HealthCheck => StatusUpdate::HealthCheck(parse_bool(payload)?),
            Self::SprinklerPosition => StatusUpdate::SprinklerPosition(parse_f64(payload)?),
            Self::ValvePosition => StatusUpdate::ValvePosition(parse_f64(payload)?),
            Self::SprinklerCalibComplete => {
                StatusUpdate::SprinklerCalibComplete(parse_bool(payload)?)
            }
            Self::ValveCalibComplete => StatusUpdate::ValveCalibComplete(parse_bool(payload)?),
            Self::ValveIsAtTarget => StatusUpdate::ValveIsAtTarget(parse_bool(payload)?),
            Self::TaskCurrentIndex => StatusUpdate::TaskCurrentIndex(parse_i64(payload)?),
            Self::TaskCurrentCount => StatusUpdate::TaskCurrentCount(parse_i64(payload)?),
            Self::TaskArray => StatusUpdate::TaskArray(payload.to_owned()),
            Self::TaskAllComplete => StatusUpdate::TaskAllComplete(parse_bool(payload)?),
        };
        Ok(update)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic {0:?} is not a <device>/status/<path> topic")]
    NotStatus(String),
    #[error("unrecognised status suffix {suffix:?} on topic {topic:?}")]
    UnknownSuffix { topic: String, suffix: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {expected} payload, got {payload:?}")]
pub struct PayloadError {
    pub expected: &'static str,
    pub payload: String,
}

/// Split an inbound topic into its device ID and status field.
pub fn parse_status_topic(topic: &str) -> Result<(&str, StatusTopic), TopicError> {
    let mut parts = topic.splitn(3, '/');
    let (Some(device_id), Some(STATUS_SEGMENT), Some(suffix)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(TopicError::NotStatus(topic.to_owned()));
    };
    if device_id.is_empty() {
        return Err(TopicError::NotStatus(topic.to_owned()));
    }
    let field = StatusTopic::from_suffix(suffix).ok_or_else(|| TopicError::UnknownSuffix {
        topic: topic.to_owned(),
        suffix: suffix.to_owned(),
    })?;
    Ok((device_id, field))
}

fn parse_bool(payload: &str) -> Result<bool, PayloadError> {
    match payload.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(PayloadError { expected: "boolean", payload: payload.to_owned() }),
    }
}

fn parse_f64(payload: &str) -> Result<f64, PayloadError> {
    payload
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PayloadError { expected: "float", payload: payload.to_owned() })
}

fn parse_i64(payload: &str) -> Result<i64, PayloadError> {
    payload
        .trim()
        .parse::<i64>()
        .map_err(|_| PayloadError { expected: "integer", payload: payload.to_owned() })
}

// ---------------------------------------------------------------------------
// Outbound command topics: <device_id>/cmd/<path>
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SprinklerHome,
    ValveHome,
    TaskSet,
    TriggerSolenoidValve,
}

impl Command {
    fn path(self) -> &'static str {
        match self {
            Self::SprinklerHome => "sprinkler/home",
            Self::ValveHome => "valve/home",
            Self::TaskSet => "task/set",
            Self::TriggerSolenoidValve => "trigger_solenoid_valve",
        }
    }

    pub fn topic(self, device_id: &str) -> String {
        format!("{device_id}/{COMMAND_SEGMENT}/{}", self.path())
    }
}
