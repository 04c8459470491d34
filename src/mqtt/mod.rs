pub mod gateway;
pub mod topics;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::status_store::{DeviceStatus, DeviceStatusStore};

pub use self::gateway::{MqttGateway, MqttSettings};
use self::topics::parse_status_topic;

/// Outbound half of the message bus as seen by the orchestration engine.
///
/// A successful return means the transport acknowledged delivery; anything
/// else is reported back to the caller.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no broker acknowledgement for {topic} within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },
    #[error("failed to queue publish to {topic}: {source}")]
    Transport {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("connection lost before {topic} was acknowledged")]
    Disconnected { topic: String },
}

/// Route one inbound message into the status store.
///
/// Unknown topics and unparseable payloads are logged and dropped; the
/// caller keeps processing subsequent messages either way.
pub async fn dispatch(
    store: &DeviceStatusStore,
    topic: &str,
    payload: &[u8],
) -> Option<DeviceStatus> {
    let (device_id, field) = match parse_status_topic(topic) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Dropping message on unhandled topic");
            return None;
        }
    };

    let Ok(text) = std::str::from_utf8(payload) else {
        warn!(topic = %topic, bytes = payload.len(), "Dropping non UTF-8 status payload");
        return None;
    };

    let update = match field.decode(text) {
        Ok(update) => update,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Failed to parse status payload");
            return None;
        }
    };

    let status = store.update(device_id, update).await;
    debug!(device_id = %device_id, topic = %topic, status = ?status, "Device status updated");
    Some(status)
}
