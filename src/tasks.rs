use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::debug;

/// A single externally defined task, as stored on disk:
///
/// ```json
/// { "payload": { "durationSec": 300 }, "timeoutMinutes": 1 }
/// ```
///
/// `payload` is kept as raw JSON and published byte-for-byte.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub payload: Box<RawValue>,
    pub timeout_minutes: u64,
}

/// Longest accepted task deadline: one week.
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

impl TaskDefinition {
    pub fn parse(bytes: &[u8], origin: &str) -> Result<Self, TaskLoadError> {
        let def: Self = serde_json::from_slice(bytes).map_err(|source| TaskLoadError::Parse {
            origin: origin.to_owned(),
            source,
        })?;
        if def.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(TaskLoadError::TimeoutOutOfRange {
                origin: origin.to_owned(),
                minutes: def.timeout_minutes,
            });
        }
        Ok(def)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payload.get().as_bytes().to_vec()
    }
}

#[derive(Debug, Error)]
pub enum TaskLoadError {
    #[error("failed to read task file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse task definition from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("task definition from {origin} has timeoutMinutes {minutes}, above the one-week limit")]
    TimeoutOutOfRange { origin: String, minutes: u64 },
}

/// Resolves `(device_id, task_id)` to a fresh `TaskDefinition`.
#[async_trait]
pub trait TaskLoader: Send + Sync {
    async fn load(&self, device_id: &str, task_id: &str) -> Result<TaskDefinition, TaskLoadError>;
}

/// Reads `<dir>/<device_id>_<task_id>.json` on every call.
#[derive(Debug, Clone)]
pub struct FileTaskLoader {
    dir: PathBuf,
}

impl FileTaskLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path_for(&self, device_id: &str, task_id: &str) -> PathBuf {
        self.dir.join(format!("{device_id}_{task_id}.json"))
    }
}

#[async_trait]
impl TaskLoader for FileTaskLoader {
    async fn load(&self, device_id: &str, task_id: &str) -> Result<TaskDefinition, TaskLoadError> {
        let path = self.path_for(device_id, task_id);
        let shown = path.display().to_string();
        debug!(device_id = %device_id, task_id = %task_id, path = %shown, "Loading task definition");

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| TaskLoadError::Read { path: shown.clone(), source })?;
        TaskDefinition::parse(&bytes, &shown)
    }
}
