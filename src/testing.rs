//! In-memory stand-ins for the engine's collaborators, shared by unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveTime;

use crate::{
    config::{DeviceConfig, DeviceKind},
    db::{
        models::{JobRecord, JobStatus},
        HistoryQuery, HistoryRecorder,
    },
    engine::{Engine, EngineTimings},
    mqtt::{MessageSink, PublishError},
    notify::{Notification, NotificationTransport, Notifier},
    status_store::{DeviceStatus, DeviceStatusStore, StatusUpdate},
    tasks::{TaskDefinition, TaskLoadError, TaskLoader},
};

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

struct Reply {
    updates: Vec<StatusUpdate>,
    /// `None` answers every publish.
    remaining: Option<usize>,
}

/// Records publishes and plays the device's side by writing scripted status
/// updates into the store as soon as a command arrives.
pub struct FakeBus {
    store: DeviceStatusStore,
    published: Mutex<Vec<(String, String)>>,
    snapshots: Mutex<Vec<(String, DeviceStatus)>>,
    replies: Mutex<HashMap<String, Reply>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeBus {
    pub fn new(store: DeviceStatusStore) -> Self {
        Self {
            store,
            published: Mutex::default(),
            snapshots: Mutex::default(),
            replies: Mutex::default(),
            failing: Mutex::default(),
        }
    }

    pub fn reply(&self, topic: &str, updates: Vec<StatusUpdate>) {
        self.replies
            .lock()
            .unwrap()
            .insert(topic.to_owned(), Reply { updates, remaining: None });
    }

    pub fn reply_times(&self, topic: &str, updates: Vec<StatusUpdate>, times: usize) {
        self.replies
            .lock()
            .unwrap()
            .insert(topic.to_owned(), Reply { updates, remaining: Some(times) });
    }

    /// Every publish to `topic` fails as if the broker never acknowledged it.
    pub fn fail(&self, topic: &str) {
        self.failing.lock().unwrap().insert(topic.to_owned());
    }

    /// `(topic, payload)` in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Device status as it was at the moment of each publish.
    pub fn snapshots(&self) -> Vec<(String, DeviceStatus)> {
        self.snapshots.lock().unwrap().clone()
    }

    fn take_reply(&self, topic: &str) -> Vec<StatusUpdate> {
        let mut replies = self.replies.lock().unwrap();
        let Some(reply) = replies.get_mut(topic) else {
            return Vec::new();
        };
        match reply.remaining {
            Some(0) => Vec::new(),
            Some(n) => {
                reply.remaining = Some(n - 1);
                reply.updates.clone()
            }
            None => reply.updates.clone(),
        }
    }
}

#[async_trait]
impl MessageSink for FakeBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let device_id = topic.split('/').next().unwrap_or_default().to_owned();
        let snapshot = self.store.get(&device_id).await;
        self.snapshots.lock().unwrap().push((topic.to_owned(), snapshot));
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), String::from_utf8_lossy(&payload).into_owned()));

        let failing = self.failing.lock().unwrap().contains(topic);
        if failing {
            return Err(PublishError::AckTimeout {
                topic: topic.to_owned(),
                timeout: Duration::from_secs(5),
            });
        }

        let updates = self.take_reply(topic);
        for update in updates {
            self.store.update(&device_id, update).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<JobRecord>>,
    /// Every status written, in write order.
    transitions: Mutex<Vec<(i64, JobStatus)>>,
}

impl MemoryHistory {
    pub fn records(&self) -> Vec<JobRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<JobRecord> {
        self.records.lock().unwrap().last().cloned()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.transitions.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn create(&self, record: &mut JobRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        record.id = records.len() as i64 + 1;
        records.push(record.clone());
        self.transitions.lock().unwrap().push((record.id, record.status));
        Ok(())
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let slot = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| anyhow!("no record {}", record.id))?;
        *slot = record.clone();
        self.transitions.lock().unwrap().push((record.id, record.status));
        Ok(())
    }
}

#[async_trait]
impl HistoryQuery for MemoryHistory {
    async fn recent(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportLog {
    sent: Vec<Notification>,
    failures: VecDeque<String>,
    attempts: usize,
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    /// The next send fails with `error` as its message.
    pub fn fail_next(&self, error: &str) {
        self.log.lock().unwrap().failures.push_back(error.to_owned());
    }

    /// Successfully delivered notifications.
    pub fn sent(&self) -> Vec<Notification> {
        self.log.lock().unwrap().sent.clone()
    }

    /// Calls that reached the transport, failed ones included.
    pub fn attempts(&self) -> usize {
        self.log.lock().unwrap().attempts
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.attempts += 1;
        if let Some(error) = log.failures.pop_front() {
            return Err(anyhow!(error));
        }
        log.sent.push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticTaskLoader {
    definitions: HashMap<(String, String), String>,
    loads: Mutex<Vec<String>>,
}

impl StaticTaskLoader {
    pub fn insert(&mut self, device_id: &str, task_id: &str, json: &str) {
        self.definitions
            .insert((device_id.to_owned(), task_id.to_owned()), json.to_owned());
    }

    /// Task IDs requested so far, in order.
    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskLoader for StaticTaskLoader {
    async fn load(&self, device_id: &str, task_id: &str) -> Result<TaskDefinition, TaskLoadError> {
        self.loads.lock().unwrap().push(task_id.to_owned());
        let origin = format!("{device_id}_{task_id}.json");
        match self.definitions.get(&(device_id.to_owned(), task_id.to_owned())) {
            Some(json) => TaskDefinition::parse(json.as_bytes(), &origin),
            None => Err(TaskLoadError::Read {
                path: origin,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such task"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn sprinkler(id: &str, task_ids: &[&str]) -> DeviceConfig {
    DeviceConfig {
        id: id.to_owned(),
        kind: DeviceKind::Sprinkler,
        schedule_times: vec![NaiveTime::from_hms_opt(6, 0, 0).unwrap()],
        schedule_duration: 0,
        task_ids: task_ids.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn plant_pot(id: &str, duration: u32) -> DeviceConfig {
    DeviceConfig {
        id: id.to_owned(),
        kind: DeviceKind::PlantPot,
        schedule_times: vec![NaiveTime::from_hms_opt(18, 30, 0).unwrap()],
        schedule_duration: duration,
        task_ids: Vec::new(),
    }
}

/// An engine wired to in-memory collaborators, with handles on each of them.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: DeviceStatusStore,
    pub bus: Arc<FakeBus>,
    pub history: Arc<MemoryHistory>,
    pub tasks: Arc<StaticTaskLoader>,
    pub transport: RecordingTransport,
}

impl Harness {
    pub fn new(devices: Vec<DeviceConfig>, tasks: StaticTaskLoader) -> Self {
        let store = DeviceStatusStore::new();
        let bus = Arc::new(FakeBus::new(store.clone()));
        let history = Arc::new(MemoryHistory::default());
        let tasks = Arc::new(tasks);
        let transport = RecordingTransport::default();
        let notifier = Arc::new(Notifier::new(Arc::new(transport.clone())));

        let engine = Arc::new(Engine::new(
            devices,
            store.clone(),
            bus.clone(),
            tasks.clone(),
            notifier,
            history.clone(),
            EngineTimings::default(),
        ));

        Self { engine, store, bus, history, tasks, transport }
    }
}
