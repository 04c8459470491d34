use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Mirrors the `job_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Started,
    Completed,
    Failed,
    CalibrationTimeout,
    TaskTimeout,
    TaskError,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Scheduled | Self::Started)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Started => "started",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CalibrationTimeout => "calibration_timeout",
            JobStatus::TaskTimeout => "task_timeout",
            JobStatus::TaskError => "task_error",
        };
        f.write_str(s)
    }
}

/// One device job in the audit history.
///
/// Created as `scheduled`, moved to `started`, then finished exactly once;
/// after that the record no longer changes.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct JobRecord {
    /// Assigned by the recorder on `create`; `0` until then.
    pub id: i64,
    pub device_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Wall-clock seconds between start and end, set when the job finishes.
    pub duration_secs: Option<i64>,
    pub notes: String,
}

impl JobRecord {
    pub fn scheduled(device_id: &str, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            device_id: device_id.to_owned(),
            scheduled_at,
            started_at: None,
            ended_at: None,
            status: JobStatus::Scheduled,
            duration_secs: None,
            notes: String::new(),
        }
    }

    pub fn start(&mut self, notes: impl Into<String>) {
        if self.status != JobStatus::Scheduled {
            return;
        }
        self.started_at = Some(Utc::now());
        self.status = JobStatus::Started;
        self.notes = notes.into();
    }

    /// Move to a terminal status. Returns `false` if the record was already terminal.
    pub fn finish(&mut self, status: JobStatus, notes: impl Into<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.duration_secs = self.started_at.map(|s| (ended_at - s).num_seconds());
        self.status = status;
        self.notes = notes.into();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_scheduled_started_completed() {
        let mut record = JobRecord::scheduled("dev1", Utc::now());
        assert_eq!(record.status, JobStatus::Scheduled);
        assert!(record.started_at.is_none());

        record.start("Processing device: dev1");
        assert_eq!(record.status, JobStatus::Started);
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_none());

        assert!(record.finish(JobStatus::Completed, "done"));
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.ended_at.is_some());
        assert!(record.duration_secs.unwrap() >= 0);
    }

    #[test]
    fn terminal_record_is_immutable() {
        let mut record = JobRecord::scheduled("dev1", Utc::now());
        record.start("");
        record.finish(JobStatus::TaskTimeout, "timed out");

        assert!(!record.finish(JobStatus::Completed, "late success"));
        record.start("again");
        assert_eq!(record.status, JobStatus::TaskTimeout);
        assert_eq!(record.notes, "timed out");
    }

    #[test]
    fn finish_requires_terminal_status() {
        let mut record = JobRecord::scheduled("dev1", Utc::now());
        assert!(!record.finish(JobStatus::Started, ""));
        assert_eq!(record.status, JobStatus::Scheduled);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(JobStatus::CalibrationTimeout).unwrap(),
            serde_json::json!("calibration_timeout")
        );
        assert_eq!(JobStatus::TaskError.to_string(), "task_error");
    }
}
