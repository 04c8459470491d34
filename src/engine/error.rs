use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{
    db::models::JobStatus, mqtt::topics::Command, mqtt::PublishError, status_store::DeviceStatus,
    tasks::TaskLoadError,
};

/// A mechanical axis that must be homed before tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Sprinkler,
    Valve,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Sprinkler, Axis::Valve];

    pub fn home_command(self) -> Command {
        match self {
            Axis::Sprinkler => Command::SprinklerHome,
            Axis::Valve => Command::ValveHome,
        }
    }

    pub fn is_calibrated(self, status: &DeviceStatus) -> bool {
        match self {
            Axis::Sprinkler => status.sprinkler_calib_complete,
            Axis::Valve => status.valve_calib_complete,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Sprinkler => f.write_str("sprinkler"),
            Axis::Valve => f.write_str("valve"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("{axis} calibration for device {device_id} timed out after {timeout:?}")]
    CalibrationTimeout {
        device_id: String,
        axis: Axis,
        timeout: Duration,
    },

    #[error("task '{task_id}' for device '{device_id}' timed out after {minutes} minutes")]
    TaskTimeout {
        device_id: String,
        task_id: String,
        minutes: u64,
    },

    #[error("task '{task_id}' for device '{device_id}' could not be loaded: {source}")]
    TaskDefinition {
        device_id: String,
        task_id: String,
        #[source]
        source: TaskLoadError,
    },

    #[error("health check failed for plant pot {0}")]
    HealthCheckFailed(String),

    #[error("failed to publish command for device {device_id}: {source}")]
    Publish {
        device_id: String,
        #[source]
        source: PublishError,
    },
}

impl JobError {
    /// Terminal history status recorded for this failure.
    pub fn job_status(&self) -> JobStatus {
        match self {
            JobError::CalibrationTimeout { .. } => JobStatus::CalibrationTimeout,
            JobError::TaskTimeout { .. } => JobStatus::TaskTimeout,
            JobError::TaskDefinition { .. } => JobStatus::TaskError,
            JobError::DeviceNotFound(_)
            | JobError::HealthCheckFailed(_)
            | JobError::Publish { .. } => JobStatus::Failed,
        }
    }

    /// Short operator-facing title for the error notification.
    pub fn title(&self) -> &'static str {
        match self {
            JobError::DeviceNotFound(_) => "Device Not Found",
            JobError::CalibrationTimeout { .. } => "Calibration Timeout",
            JobError::TaskTimeout { .. } => "Task Timeout",
            JobError::TaskDefinition { .. } => "Task Error",
            JobError::HealthCheckFailed(_) => "Plant Pot Health Check Failed",
            JobError::Publish { .. } => "Publish Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_per_failure_kind() {
        let timeout = JobError::TaskTimeout {
            device_id: "d".into(),
            task_id: "t".into(),
            minutes: 1,
        };
        assert_eq!(timeout.job_status(), JobStatus::TaskTimeout);
        assert_eq!(
            timeout.to_string(),
            "task 't' for device 'd' timed out after 1 minutes"
        );

        let calib = JobError::CalibrationTimeout {
            device_id: "d".into(),
            axis: Axis::Valve,
            timeout: Duration::from_secs(120),
        };
        assert_eq!(calib.job_status(), JobStatus::CalibrationTimeout);
        assert!(calib.to_string().starts_with("valve calibration"));

        assert_eq!(JobError::HealthCheckFailed("p".into()).job_status(), JobStatus::Failed);
    }

    #[test]
    fn axis_flags() {
        let status = DeviceStatus { valve_calib_complete: true, ..Default::default() };
        assert!(!Axis::Sprinkler.is_calibrated(&status));
        assert!(Axis::Valve.is_calibrated(&status));
        assert_eq!(Axis::Valve.home_command(), Command::ValveHome);
    }
}
