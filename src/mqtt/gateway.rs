use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use super::{dispatch, topics::StatusTopic, MessageSink, PublishError};
use crate::status_store::DeviceStatusStore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// How long `publish` waits for the broker's PUBACK.
    pub ack_timeout: Duration,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            opts.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        opts
    }
}

/// Stand-in deadline for an ack timeout too large to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Destination of subscription requests.
#[async_trait]
pub(crate) trait Subscriber: Send + Sync {
    async fn subscribe_filters(&self, filters: Vec<SubscribeFilter>) -> Result<(), ClientError>;
}

#[async_trait]
impl Subscriber for AsyncClient {
    async fn subscribe_filters(&self, filters: Vec<SubscribeFilter>) -> Result<(), ClientError> {
        self.subscribe_many(filters).await
    }
}

/// MQTT-backed message gateway.
///
/// Owns the rumqttc client; a background task drives the event loop, feeds
/// inbound status messages into the `DeviceStatusStore`, resolves QoS 1
/// acknowledgements and restores subscriptions after every reconnect.
#[derive(Clone)]
pub struct MqttGateway {
    inner: Arc<Inner>,
}

struct Inner {
    client: AsyncClient,
    subscriber: Arc<dyn Subscriber>,
    store: DeviceStatusStore,
    subscribed: Mutex<BTreeSet<String>>,
    acks: Mutex<AckTracker>,
    /// Keeps the order of ack waiters identical to the order of requests.
    publish_order: Mutex<()>,
    ack_timeout: Duration,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttGateway {
    /// Connect to the broker and start the event loop.
    ///
    /// Fails if the broker does not accept the connection within
    /// `CONNECT_TIMEOUT`; there is no retry at this stage.
    pub async fn connect(settings: MqttSettings, store: DeviceStatusStore) -> Result<Self> {
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "Connecting to MQTT broker");
        let (client, mut eventloop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);

        time::timeout(CONNECT_TIMEOUT, async {
            loop {
                if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
                    return Ok::<_, rumqttc::ConnectionError>(());
                }
            }
        })
        .await
        .context("timed out waiting for MQTT CONNACK")?
        .context("MQTT connection failed")?;
        info!("Connected to MQTT broker");

        let gateway = Self::from_parts(
            client.clone(),
            Arc::new(client),
            store,
            settings.ack_timeout,
        );
        let handle = tokio::spawn(run_event_loop(gateway.inner.clone(), eventloop));
        if let Ok(mut slot) = gateway.inner.event_loop.lock() {
            *slot = Some(handle);
        }

        Ok(gateway)
    }

    fn from_parts(
        client: AsyncClient,
        subscriber: Arc<dyn Subscriber>,
        store: DeviceStatusStore,
        ack_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            client,
            subscriber,
            store,
            subscribed: Mutex::new(BTreeSet::new()),
            acks: Mutex::new(AckTracker::default()),
            publish_order: Mutex::new(()),
            ack_timeout,
            event_loop: std::sync::Mutex::new(None),
        });
        Self { inner }
    }

    /// Subscribe to every status topic of `device_id` and remember the device
    /// so its subscriptions are restored after a reconnect.
    pub async fn subscribe_device(&self, device_id: &str) -> Result<(), ClientError> {
        self.inner.subscribed.lock().await.insert(device_id.to_owned());
        self.inner.subscribe_topics(device_id).await
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.inner.client.disconnect().await {
            warn!(error = %e, "MQTT disconnect request failed");
        }
        if let Ok(mut slot) = self.inner.event_loop.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        info!("MQTT gateway stopped");
    }
}

/// Publishing is bounded end to end by `ack_timeout`: waiting for the
/// publish order, queueing the request and waiting for the PUBACK all share
/// one deadline. A request that was queued before the deadline passed stays
/// queued and is still delivered once the broker is reachable again.
#[async_trait]
impl MessageSink for MqttGateway {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(self.inner.ack_timeout)
            .unwrap_or(now + FAR_FUTURE);
        let timed_out = || PublishError::AckTimeout {
            topic: topic.to_owned(),
            timeout: self.inner.ack_timeout,
        };

        let ack = {
            let Ok(_order) = time::timeout_at(deadline, self.inner.publish_order.lock()).await
            else {
                return Err(timed_out());
            };
            let ack = self.inner.acks.lock().await.enqueue();
            let queued = time::timeout_at(
                deadline,
                self.inner.client.publish(topic, QoS::AtLeastOnce, false, payload),
            )
            .await;
            match queued {
                Ok(Ok(())) => ack,
                Ok(Err(source)) => {
                    self.inner.acks.lock().await.cancel_last();
                    return Err(PublishError::Transport { topic: topic.to_owned(), source });
                }
                Err(_) => {
                    self.inner.acks.lock().await.cancel_last();
                    warn!(topic = %topic, "MQTT request queue full; publish not queued");
                    return Err(timed_out());
                }
            }
        };

        match time::timeout_at(deadline, ack).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, "Publish acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(PublishError::Disconnected { topic: topic.to_owned() }),
            Err(_) => Err(timed_out()),
        }
    }
}

impl Inner {
    async fn subscribe_topics(&self, device_id: &str) -> Result<(), ClientError> {
        let filters = StatusTopic::ALL
            .iter()
            .map(|t| SubscribeFilter::new(t.topic(device_id), QoS::AtLeastOnce))
            .collect();
        self.subscriber.subscribe_filters(filters).await?;
        info!(device_id = %device_id, topics = StatusTopic::ALL.len(), "Subscribed to device status topics");
        Ok(())
    }

    async fn resubscribe_all(&self) {
        let devices: Vec<String> = self.subscribed.lock().await.iter().cloned().collect();
        for device_id in devices {
            info!(device_id = %device_id, "Re-subscribing after reconnect");
            if let Err(e) = self.subscribe_topics(&device_id).await {
                error!(device_id = %device_id, error = %e, "Failed to re-subscribe device topics");
            }
        }
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(event) => handle_event(&inner, event).await,
            Err(e) => {
                warn!(error = %e, "Connection to MQTT broker lost; retrying");
                inner.acks.lock().await.connection_lost();
                time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn handle_event(inner: &Arc<Inner>, event: Event) {
    match event {
        Event::Incoming(Packet::Publish(publish)) => {
            dispatch(&inner.store, &publish.topic, &publish.payload).await;
        }
        Event::Incoming(Packet::PubAck(ack)) => {
            inner.acks.lock().await.acknowledge(ack.pkid);
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => {
            inner.acks.lock().await.sent(pkid);
        }
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("Reconnected to MQTT broker");
            // Subscribing goes through the request channel this loop drains,
            // so it must not be awaited here.
            let inner = inner.clone();
            tokio::spawn(async move { inner.resubscribe_all().await });
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// QoS 1 acknowledgement tracking
// ---------------------------------------------------------------------------

/// Pairs publish calls with the broker's PUBACKs.
///
/// rumqttc assigns packet ids when a request leaves the event loop, so
/// waiters queue up in request order and are bound to a pkid on the
/// matching `Outgoing::Publish` event.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    /// Publishes whose waiters were dropped on connection loss; rumqttc
    /// retransmits them after reconnecting.
    orphaned: HashSet<u16>,
}

impl AckTracker {
    fn enqueue(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if self.inflight.contains_key(&pkid) || self.orphaned.remove(&pkid) {
            return;
        }
        if let Some(tx) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn acknowledge(&mut self, pkid: u16) {
        self.orphaned.remove(&pkid);
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn connection_lost(&mut self) {
        let dropped: Vec<u16> = self.inflight.drain().map(|(pkid, _)| pkid).collect();
        self.orphaned.extend(dropped);
    }
}
