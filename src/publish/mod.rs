// src/publish/mod.rs
//
// Publisher pipeline: the bounded telemetry queue fed by the polling engine,
// and the dispatcher that fans completed records out to the enabled
// northbound sinks (MQTT, HTTP, or both).

pub mod http;
pub mod mqtt;
pub mod payload;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::types::ServerConfig;
use crate::poll::TelemetryRecord;
use crate::ControlFlags;

/// Records held between the engine and the dispatcher. Small: each sink keeps
/// only the newest record per device beyond this.
pub const QUEUE_CAPACITY: usize = 32;

/// Bounded MPSC hand-off from the polling engine. Backpressures by dropping
/// the oldest record and counting the drop.
pub struct TelemetryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    records: VecDeque<TelemetryRecord>,
    dropped: u64,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                records: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a record. A full queue drops its oldest entry.
    pub fn push(&self, record: TelemetryRecord) {
        {
            let mut inner = self.inner.lock().expect("telemetry queue poisoned");
            if inner.records.len() >= self.capacity {
                inner.records.pop_front();
                inner.dropped += 1;
            }
            inner.records.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Take everything queued, waiting up to `wait` when empty.
    pub async fn drain(&self, wait: Duration) -> Vec<TelemetryRecord> {
        {
            let mut inner = self.inner.lock().expect("telemetry queue poisoned");
            if !inner.records.is_empty() {
                return inner.records.drain(..).collect();
            }
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        let mut inner = self.inner.lock().expect("telemetry queue poisoned");
        inner.records.drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().expect("telemetry queue poisoned").dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("telemetry queue poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TelemetryQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

/// Newest record per device, held by one sink between its publish ticks.
#[derive(Default)]
pub struct PendingStore {
    inner: Mutex<HashMap<String, TelemetryRecord>>,
}

impl PendingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offer(&self, record: TelemetryRecord) {
        self.inner
            .lock()
            .expect("pending store poisoned")
            .insert(record.device_id.clone(), record);
    }

    /// Take everything pending, ordered by device id.
    pub fn take_all(&self) -> Vec<TelemetryRecord> {
        let mut records: Vec<TelemetryRecord> = self
            .inner
            .lock()
            .expect("pending store poisoned")
            .drain()
            .map(|(_, r)| r)
            .collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("pending store poisoned").is_empty()
    }
}

/// Wire the enabled publishers to the telemetry queue and spawn their tasks.
pub fn spawn_publisher_tasks(
    server: &ServerConfig,
    queue: Arc<TelemetryQueue>,
    flags: Arc<ControlFlags>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let mut sinks: Vec<Arc<PendingStore>> = Vec::new();

    if server.protocol.mqtt_enabled() {
        let (mqtt_sinks, mqtt_handles) =
            mqtt::spawn_mqtt_publisher(&server.mqtt_config, flags.clone());
        sinks.extend(mqtt_sinks);
        handles.extend(mqtt_handles);
    }

    if server.protocol.http_enabled() {
        let (http_sink, http_handle) =
            http::spawn_http_publisher(&server.http_config, flags.clone());
        if let Some(handle) = http_handle {
            sinks.push(http_sink);
            handles.push(handle);
        }
    }

    if sinks.is_empty() {
        tlog!("[Publisher] No northbound sink enabled; records are discarded");
    }

    // Dispatcher: every record reaches each enabled sink independently
    handles.push(tokio::spawn(async move {
        loop {
            if flags.stopped() {
                break;
            }
            let records = queue.drain(Duration::from_millis(500)).await;
            for record in records {
                for sink in &sinks {
                    sink.offer(record.clone());
                }
            }
        }
        tlog!("[Publisher] Dispatcher stopped");
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(device_id: &str, timestamp: i64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: device_id.to_string(),
            device_name: device_id.to_string(),
            timestamp,
            registers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = TelemetryQueue::new(3);
        for i in 0..5 {
            queue.push(record(&format!("DEV{:03}", i), i));
        }
        assert_eq!(queue.dropped_count(), 2);

        let records = queue.drain(Duration::from_millis(1)).await;
        let ids: Vec<&str> = records.iter().map(|r| r.device_id.as_str()).collect();
        // Oldest two were dropped; order preserved for the rest
        assert_eq!(ids, vec!["DEV002", "DEV003", "DEV004"]);
    }

    #[tokio::test]
    async fn test_queue_drain_waits_for_push() {
        let queue = Arc::new(TelemetryQueue::default());
        let pusher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(record("AAAAAA", 1));
        });
        let records = queue.drain(Duration::from_secs(1)).await;
        assert_eq!(records.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pending_store_keeps_newest_per_device() {
        let store = PendingStore::new();
        store.offer(record("AAAAAA", 1));
        store.offer(record("AAAAAA", 2));
        store.offer(record("BBBBBB", 1));

        let records = store.take_all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device_id, "AAAAAA");
        assert_eq!(records[0].timestamp, 2);
        assert!(store.is_empty());
    }
}
