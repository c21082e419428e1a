// src/publish/mqtt.rs
//
// MQTT publisher. Two publish modes:
//   default   - the whole record on one topic, per the configured interval
//   customize - named topics, each carrying a register subset on its own timer
//
// The connection is watched by an event-loop task; publish tasks consult the
// connected flag and divert into a bounded offline buffer while the broker is
// unreachable. On reconnect the buffer drains oldest-first. Reconnect
// attempts back off exponentially, capped at 60 s, and pause while the
// configuration channel holds the foreground.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};

use crate::config::types::{MqttConfig, PublishMode};
use crate::publish::{payload, PendingStore};
use crate::ControlFlags;

/// Records held while the broker is unreachable. PSRAM-backed on constrained
/// targets; plain heap here.
pub const OFFLINE_BUFFER_CAPACITY: usize = 100;

/// Reconnect backoff cap.
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Slice used when waiting out the configuration foreground.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

// ============================================================================
// Offline Buffer
// ============================================================================

/// Bounded FIFO of unpublished messages. Drops oldest when full and counts
/// the drops for the status surface.
pub struct OfflineBuffer {
    entries: VecDeque<(String, Vec<u8>)>,
    capacity: usize,
    dropped: u64,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, topic: String, payload: Vec<u8>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back((topic, payload));
    }

    pub fn pop_oldest(&mut self) -> Option<(String, Vec<u8>)> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

// ============================================================================
// Shared Connection State
// ============================================================================

/// Client handle plus connection state, shared by every publish task.
pub struct MqttShared {
    client: AsyncClient,
    connected: AtomicBool,
    offline: Mutex<OfflineBuffer>,
    qos: QoS,
}

impl MqttShared {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn offline_len(&self) -> usize {
        self.offline.lock().expect("offline buffer poisoned").len()
    }

    pub fn offline_dropped(&self) -> u64 {
        self.offline
            .lock()
            .expect("offline buffer poisoned")
            .dropped_count()
    }

    /// Publish one payload, or park it in the offline buffer when the broker
    /// is unreachable. Buffered messages drain first so ordering holds.
    pub async fn publish_or_buffer(&self, topic: &str, body: Vec<u8>) {
        if !self.connected() {
            self.offline
                .lock()
                .expect("offline buffer poisoned")
                .push(topic.to_string(), body);
            return;
        }

        self.drain_offline().await;

        if let Err(e) = self
            .client
            .publish(topic, self.qos, false, body.clone())
            .await
        {
            tlog!("[MQTT] Publish to '{}' failed: {}; buffering", topic, e);
            self.offline
                .lock()
                .expect("offline buffer poisoned")
                .push(topic.to_string(), body);
        }
    }

    /// Oldest-first drain of the offline buffer while connected.
    pub async fn drain_offline(&self) {
        loop {
            if !self.connected() {
                return;
            }
            let entry = self
                .offline
                .lock()
                .expect("offline buffer poisoned")
                .pop_oldest();
            let Some((topic, body)) = entry else {
                return;
            };
            if let Err(e) = self.client.publish(&topic, self.qos, false, body.clone()).await {
                tlog!("[MQTT] Offline drain to '{}' failed: {}", topic, e);
                // Put it back at the front and give up this round
                let mut offline = self.offline.lock().expect("offline buffer poisoned");
                offline.entries.push_front((topic, body));
                return;
            }
        }
    }
}

// ============================================================================
// Publisher Wiring
// ============================================================================

/// Client id derived from the device MAC, e.g. `fieldgate-a4cf12b90370`.
fn client_id(cfg: &MqttConfig) -> String {
    let mac: String = cfg
        .client_mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    if mac.is_empty() {
        format!("fieldgate-{}", fallback_id())
    } else {
        format!("fieldgate-{}", mac)
    }
}

/// Generate a simple unique suffix when no MAC is configured.
fn fallback_id() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", timestamp)
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Build the client, spawn the event loop and the mode-appropriate publish
/// tasks. Returns the pending stores the dispatcher feeds.
pub fn spawn_mqtt_publisher(
    cfg: &MqttConfig,
    flags: Arc<ControlFlags>,
) -> (Vec<Arc<PendingStore>>, Vec<tokio::task::JoinHandle<()>>) {
    let mut options = MqttOptions::new(client_id(cfg), &cfg.broker_host, cfg.broker_port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    options.set_clean_session(!cfg.persistent_session);
    if !cfg.username.is_empty() {
        options.set_credentials(&cfg.username, &cfg.password);
    }
    if cfg.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);

    let shared = Arc::new(MqttShared {
        client,
        connected: AtomicBool::new(false),
        offline: Mutex::new(OfflineBuffer::new(OFFLINE_BUFFER_CAPACITY)),
        qos: to_qos(cfg.qos),
    });

    let mut handles = vec![spawn_event_loop(
        eventloop,
        shared.clone(),
        flags.clone(),
        format!("{}:{}", cfg.broker_host, cfg.broker_port),
    )];
    let mut sinks = Vec::new();

    match cfg.publish_mode {
        PublishMode::Default => {
            let store = PendingStore::new();
            handles.push(spawn_default_mode_task(
                shared.clone(),
                store.clone(),
                cfg.default_mode.topic_publish.clone(),
                cfg.default_mode.interval.as_duration(),
                flags.clone(),
            ));
            sinks.push(store);
        }
        PublishMode::Customize => {
            for custom in &cfg.customize_mode.custom_topics {
                let store = PendingStore::new();
                handles.push(spawn_custom_topic_task(
                    shared.clone(),
                    store.clone(),
                    custom.topic.clone(),
                    custom.register_ids.clone(),
                    custom.interval.as_duration(),
                    flags.clone(),
                ));
                sinks.push(store);
            }
        }
    }

    (sinks, handles)
}

/// Drive the rumqttc event loop: tracks the connected flag and backs off on
/// connection errors, pausing while the configuration channel is active.
fn spawn_event_loop(
    mut eventloop: rumqttc::EventLoop,
    shared: Arc<MqttShared>,
    flags: Arc<ControlFlags>,
    broker: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            if flags.stopped() {
                break;
            }

            match tokio::time::timeout(Duration::from_millis(500), eventloop.poll()).await {
                Ok(Ok(event)) => {
                    if let Event::Incoming(Packet::ConnAck(ack)) = event {
                        if ack.code == rumqttc::ConnectReturnCode::Success {
                            tlog!("[MQTT] Connected to {}", broker);
                            shared.connected.store(true, Ordering::Relaxed);
                            backoff = Duration::from_secs(1);
                        } else {
                            tlog!("[MQTT] Broker refused connection: {:?}", ack.code);
                            shared.connected.store(false, Ordering::Relaxed);
                        }
                    }
                }
                Ok(Err(e)) => {
                    let was_connected = shared.connected.swap(false, Ordering::Relaxed);
                    if was_connected {
                        tlog!("[MQTT] Disconnected from {}: {}", broker, e);
                    } else {
                        tdbg!("mqtt", "[MQTT] Connect attempt failed: {}", e);
                    }
                    if matches!(e, ConnectionError::ConnectionRefused(_)) {
                        tlog!("[MQTT] Broker {} refused credentials", broker);
                    }

                    // Hold reconnect attempts while the configuration
                    // channel is busy, then back off exponentially. The wait
                    // is sliced so a stop request is honoured promptly.
                    while flags.ble_command_active() && !flags.stopped() {
                        tokio::time::sleep(PAUSE_SLICE).await;
                    }
                    let mut waited = Duration::ZERO;
                    while waited < backoff && !flags.stopped() {
                        tokio::time::sleep(PAUSE_SLICE).await;
                        waited += PAUSE_SLICE;
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                }
                Err(_) => {} // poll timeout: loop to check the stop flag
            }
        }
        let _ = shared.client.disconnect().await;
        tlog!("[MQTT] Event loop stopped");
    })
}

/// Default mode: one payload per device per interval on the configured topic.
fn spawn_default_mode_task(
    shared: Arc<MqttShared>,
    store: Arc<PendingStore>,
    topic: String,
    interval: Duration,
    flags: Arc<ControlFlags>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval.max(Duration::from_millis(100)));
        tlog!(
            "[MQTT] Default mode: publishing to '{}' every {:?}",
            topic,
            interval
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = flags.wait_stopped() => break,
            }
            if flags.ble_command_active() {
                continue;
            }

            for record in store.take_all() {
                let body = match serde_json::to_vec(&payload::record_payload(&record)) {
                    Ok(body) => body,
                    Err(e) => {
                        tlog!("[MQTT] Failed to serialize record: {}", e);
                        continue;
                    }
                };
                shared.publish_or_buffer(&topic, body).await;
            }
        }
    })
}

/// Customize mode: one task per configured topic, filtering its register set.
fn spawn_custom_topic_task(
    shared: Arc<MqttShared>,
    store: Arc<PendingStore>,
    topic: String,
    register_ids: Vec<String>,
    interval: Duration,
    flags: Arc<ControlFlags>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval.max(Duration::from_millis(100)));
        tlog!(
            "[MQTT] Custom topic '{}': {} register(s) every {:?}",
            topic,
            register_ids.len(),
            interval
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = flags.wait_stopped() => break,
            }
            if flags.ble_command_active() {
                continue;
            }

            for record in store.take_all() {
                let Some(filtered) = payload::record_payload_filtered(&record, &register_ids)
                else {
                    continue;
                };
                let body = match serde_json::to_vec(&filtered) {
                    Ok(body) => body,
                    Err(e) => {
                        tlog!("[MQTT] Failed to serialize record: {}", e);
                        continue;
                    }
                };
                shared.publish_or_buffer(&topic, body).await;
            }
        }
    })
}
