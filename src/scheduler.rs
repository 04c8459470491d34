use std::sync::Arc;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{error, info};

use crate::engine::Engine;

/// Daily job clock: one timer per `(device, schedule time)` pair.
pub struct Scheduler {
    engine: Arc<Engine>,
    tz: Tz,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, tz: Tz) -> Self {
        Self { engine, tz }
    }

    /// Spawn every timer. Each one exits once `shutdown` flips to `true`.
    ///
    /// A job that overruns its next occurrence makes that occurrence be
    /// skipped rather than queued.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for device in self.engine.devices() {
            for &at in &device.schedule_times {
                info!(device_id = %device.id, at = %at.format("%H:%M"), tz = %self.tz, "Scheduling daily job");
                handles.push(tokio::spawn(run_daily(
                    self.engine.clone(),
                    device.id.clone(),
                    at,
                    self.tz,
                    shutdown.clone(),
                )));
            }
        }
        handles
    }
}

async fn run_daily(
    engine: Arc<Engine>,
    device_id: String,
    at: NaiveTime,
    tz: Tz,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let now = Utc::now();
        let next = next_occurrence(now, at, tz);
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        info!(device_id = %device_id, "Scheduled job firing");
        // Failures are already recorded and notified by the engine.
        if let Err(e) = engine.run_scheduled(&device_id).await {
            error!(device_id = %device_id, error = %e, "Scheduled job failed");
        }
    }
    info!(device_id = %device_id, "Schedule timer stopped");
}

/// First instant strictly after `now` whose wall-clock time in `tz` is `at`.
///
/// On a DST fold the earlier of the two instants is used; inside a DST gap
/// the job runs one hour later on the wall clock.
pub fn next_occurrence(now: DateTime<Utc>, at: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let mut date = now.with_timezone(&tz).date_naive();
    loop {
        let local = date.and_time(at);
        let candidate = tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(local + chrono::Duration::hours(1))).earliest());

        if let Some(candidate) = candidate {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
        date = match date.checked_add_days(Days::new(1)) {
            Some(d) => d,
            None => return now,
        };
    }
}
