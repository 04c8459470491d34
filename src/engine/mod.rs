//! Per-device job state machine.
//!
//! ```text
//! SCHEDULED ─▶ STARTED ─▶ CALIBRATING(sprinkler?) ─▶ CALIBRATING(valve?)
//!                                 │                         │
//!                                 ▼                         ▼
//!                          FAILED(reason) ◀──────── RUNNING_TASKS ─▶ COMPLETED
//! ```
//!
//! Plant pots skip straight from STARTED to a health-check gate and a single
//! trigger command. Devices run one at a time; a failure ends that device's
//! job only, the batch moves on to the next device.

pub mod error;
pub mod poll;

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time,
};
use tracing::{error, info, warn};

pub use self::error::{Axis, JobError};
use crate::{
    config::{DeviceConfig, DeviceKind},
    db::{
        models::{JobRecord, JobStatus},
        HistoryRecorder,
    },
    mqtt::{topics::Command, MessageSink},
    notify::{Notification, Notifier},
    status_store::DeviceStatusStore,
    tasks::TaskLoader,
};

/// Timing knobs for calibration and task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimings {
    pub poll_interval: Duration,
    /// Pause between publishing a task and the first completion poll.
    pub settle_delay: Duration,
    /// Deadline for each calibration axis.
    pub calibration_timeout: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(3),
            calibration_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => f.write_str("scheduled"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Unrecognised device type; nothing was done.
    Skipped,
}

/// Result of `run_all_once`, one entry per configured device.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, JobError)>,
}

pub struct Engine {
    devices: Vec<DeviceConfig>,
    store: DeviceStatusStore,
    sink: Arc<dyn MessageSink>,
    tasks: Arc<dyn TaskLoader>,
    notifier: Arc<Notifier>,
    history: Arc<dyn HistoryRecorder>,
    timings: EngineTimings,
    /// One lock per device ID, held for the whole job.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        devices: Vec<DeviceConfig>,
        store: DeviceStatusStore,
        sink: Arc<dyn MessageSink>,
        tasks: Arc<dyn TaskLoader>,
        notifier: Arc<Notifier>,
        history: Arc<dyn HistoryRecorder>,
        timings: EngineTimings,
    ) -> Self {
        Self {
            devices,
            store,
            sink,
            tasks,
            notifier,
            history,
            timings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == device_id)
    }

    /// Run every configured device once, in configuration order.
    pub async fn run_all_once(&self) -> BatchReport {
        info!(devices = self.devices.len(), "Starting manual run for all devices");
        self.notifier
            .send(Notification::info(
                "Manual Run Started",
                "Manual run for all devices has commenced.",
            ))
            .await;

        let mut report = BatchReport::default();
        for device in &self.devices {
            match self.run_device(device, Trigger::Manual).await {
                Ok(JobOutcome::Completed) => report.completed.push(device.id.clone()),
                Ok(JobOutcome::Skipped) => report.skipped.push(device.id.clone()),
                Err(e) => report.failed.push((device.id.clone(), e)),
            }
        }

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Manual run for all devices finished"
        );
        self.notifier
            .send(Notification::success(
                "Manual Run Completed",
                format!(
                    "Finished processing all devices: {} completed, {} failed, {} skipped.",
                    report.completed.len(),
                    report.failed.len(),
                    report.skipped.len()
                ),
            ))
            .await;
        report
    }

    pub async fn run_for_device(&self, device_id: &str) -> Result<JobOutcome, JobError> {
        self.run_by_id(device_id, Trigger::Manual).await
    }

    pub async fn run_scheduled(&self, device_id: &str) -> Result<JobOutcome, JobError> {
        self.run_by_id(device_id, Trigger::Scheduled).await
    }

    async fn run_by_id(&self, device_id: &str, trigger: Trigger) -> Result<JobOutcome, JobError> {
        let device = self
            .device(device_id)
            .ok_or_else(|| JobError::DeviceNotFound(device_id.to_owned()))?;
        self.run_device(device, trigger).await
    }

    async fn run_device(
        &self,
        device: &DeviceConfig,
        trigger: Trigger,
    ) -> Result<JobOutcome, JobError> {
        match &device.kind {
            DeviceKind::Sprinkler => {
                self.tracked(device, trigger, "Sprinkler", self.process_sprinkler(device))
                    .await
            }
            DeviceKind::PlantPot => {
                self.tracked(device, trigger, "Plant Pot", self.process_plant_pot(device))
                    .await
            }
            DeviceKind::Unrecognized(raw) => {
                warn!(device_id = %device.id, device_type = %raw, "Unknown device type; skipping");
                Ok(JobOutcome::Skipped)
            }
        }
    }

    /// Wrap one device job with its history record, run lock and notifications.
    ///
    /// The record is created as `scheduled` before waiting on the device
    /// lock, so a queued overlapping request is visible in the history.
    async fn tracked<F>(
        &self,
        device: &DeviceConfig,
        trigger: Trigger,
        label: &str,
        work: F,
    ) -> Result<JobOutcome, JobError>
    where
        F: Future<Output = Result<String, JobError>>,
    {
        let mut record = JobRecord::scheduled(&device.id, Utc::now());
        self.record_create(&mut record).await;

        let _guard = self.lock_device(&device.id).await;
        info!(device_id = %device.id, kind = %device.kind, trigger = %trigger, "Starting device job");
        record.start(format!("Processing device: {} ({trigger} run)", device.id));
        self.record_save(&record).await;
        self.notifier
            .send(Notification::info(
                format!("{label} Job Started: {}", device.id),
                format!("Starting {trigger} job for device {}.", device.id),
            ))
            .await;

        match work.await {
            Ok(summary) => {
                info!(device_id = %device.id, "{summary}");
                record.finish(JobStatus::Completed, summary.clone());
                self.record_save(&record).await;
                self.notifier
                    .send(Notification::success(
                        format!("{label} Job Completed: {}", device.id),
                        summary,
                    ))
                    .await;
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                error!(device_id = %device.id, error = %e, "Error processing device");
                record.finish(e.job_status(), e.to_string());
                self.record_save(&record).await;
                self.notifier
                    .send(Notification::error(
                        format!("{}: {}", e.title(), device.id),
                        e.to_string(),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sprinkler
    // -----------------------------------------------------------------------

    async fn process_sprinkler(&self, device: &DeviceConfig) -> Result<String, JobError> {
        self.calibrate(device).await?;
        self.run_tasks(device).await?;
        Ok(format!(
            "All {} tasks completed successfully.",
            device.task_ids.len()
        ))
    }

    async fn calibrate(&self, device: &DeviceConfig) -> Result<(), JobError> {
        for axis in Axis::ALL {
            let status = self.store.get(&device.id).await;
            if axis.is_calibrated(&status) {
                info!(device_id = %device.id, axis = %axis, "Axis already calibrated; skipping");
                continue;
            }

            info!(device_id = %device.id, axis = %axis, "Calibrating");
            self.publish(device, axis.home_command(), b"1".to_vec()).await?;

            let timeout = self.timings.calibration_timeout;
            poll::wait_for(
                &self.store,
                &device.id,
                timeout,
                self.timings.poll_interval,
                |s| axis.is_calibrated(s),
            )
            .await
            .map_err(|_| JobError::CalibrationTimeout {
                device_id: device.id.clone(),
                axis,
                timeout,
            })?;
            info!(device_id = %device.id, axis = %axis, "Calibration completed");
        }
        Ok(())
    }

    async fn run_tasks(&self, device: &DeviceConfig) -> Result<(), JobError> {
        let total = device.task_ids.len();
        for (index, task_id) in device.task_ids.iter().enumerate() {
            // Clear flags left over from calibration or the previous task.
            self.store.reset(&device.id).await;
            info!(device_id = %device.id, task_id = %task_id, index, total, "Processing task");

            let task = self
                .tasks
                .load(&device.id, task_id)
                .await
                .map_err(|source| JobError::TaskDefinition {
                    device_id: device.id.clone(),
                    task_id: task_id.clone(),
                    source,
                })?;

            self.publish(device, Command::TaskSet, task.payload_bytes()).await?;
            time::sleep(self.timings.settle_delay).await;

            info!(
                device_id = %device.id,
                task_id = %task_id,
                timeout_minutes = task.timeout_minutes,
                "Waiting for task completion"
            );
            poll::wait_for(
                &self.store,
                &device.id,
                task.timeout(),
                self.timings.poll_interval,
                |s| s.task_all_complete,
            )
            .await
            .map_err(|_| JobError::TaskTimeout {
                device_id: device.id.clone(),
                task_id: task_id.clone(),
                minutes: task.timeout_minutes,
            })?;
            info!(device_id = %device.id, task_id = %task_id, "Task completed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plant pot
    // -----------------------------------------------------------------------

    async fn process_plant_pot(&self, device: &DeviceConfig) -> Result<String, JobError> {
        let status = self.store.get(&device.id).await;
        if !status.health_check {
            return Err(JobError::HealthCheckFailed(device.id.clone()));
        }
        info!(device_id = %device.id, "Health check passed");

        let payload = device.schedule_duration.to_string();
        self.publish(device, Command::TriggerSolenoidValve, payload.into_bytes())
            .await?;
        Ok(format!(
            "Successfully triggered solenoid valve for plant pot {} (duration {}).",
            device.id, device.schedule_duration
        ))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn publish(
        &self,
        device: &DeviceConfig,
        command: Command,
        payload: Vec<u8>,
    ) -> Result<(), JobError> {
        let topic = command.topic(&device.id);
        info!(device_id = %device.id, topic = %topic, "Publishing command");
        self.sink
            .publish(&topic, payload)
            .await
            .map_err(|source| JobError::Publish { device_id: device.id.clone(), source })
    }

    async fn lock_device(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn record_create(&self, record: &mut JobRecord) {
        if let Err(e) = self.history.create(record).await {
            warn!(device_id = %record.device_id, error = %e, "Failed to create job history record");
        }
    }

    async fn record_save(&self, record: &JobRecord) {
        if let Err(e) = self.history.save(record).await {
            warn!(device_id = %record.device_id, status = %record.status, error = %e, "Failed to save job history record");
        }
    }
}
