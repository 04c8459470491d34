use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::status_store::{DeviceStatus, DeviceStatusStore};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("condition not met within {0:?}")]
pub struct PollTimeout(pub Duration);

/// Poll `device_id`'s status every `interval` until `done` holds or
/// `timeout` has elapsed.
///
/// The first check happens one interval after the call; the interval never
/// grows. Only the deadline ends a poll early, there is no other cancellation.
/// A timeout too large to represent as an instant means no deadline.
pub async fn wait_for<F>(
    store: &DeviceStatusStore,
    device_id: &str,
    timeout: Duration,
    interval: Duration,
    done: F,
) -> Result<DeviceStatus, PollTimeout>
where
    F: Fn(&DeviceStatus) -> bool,
{
    let start = Instant::now();
    let interval = interval.max(MIN_INTERVAL);
    let mut ticker = time::interval_at(start + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let poll = async {
        loop {
            ticker.tick().await;
            let status = store.get(device_id).await;
            if done(&status) {
                debug!(device_id = %device_id, "Flag condition met");
                return status;
            }
            debug!(device_id = %device_id, "Waiting for flag condition");
        }
    };

    match start.checked_add(timeout) {
        Some(deadline) => time::timeout_at(deadline, poll)
            .await
            .map_err(|_| PollTimeout(timeout)),
        None => Ok(poll.await),
    }
}
