// src/poll/mod.rs
//
// Polling engine: decides when each device is read, executes one batch per
// due device (every register, address order), updates health/metrics, and
// emits one TelemetryRecord per completed batch.
//
// One poll task runs per protocol family (RTU, TCP). Config changes are
// observed between cycles, never mid-batch. The `ble_command_active` flag is
// sampled before each device and between registers; while the configuration
// channel is busy the engine sleeps in 100 ms slices.

pub mod health;
pub mod recovery;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::types::DeviceConfig;
use crate::config::ConfigStore;
use crate::publish::TelemetryQueue;
use crate::transport::RegisterSource;
use crate::ControlFlags;
use health::HealthRegistry;

/// Sleep slice while the configuration channel holds the foreground.
pub const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Idle wait when no device is schedulable.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Reading quality for one register in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Ok,
    Fail,
    Stale,
}

/// One register's outcome within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterReading {
    pub value: f64,
    pub quality: Quality,
    pub unit: String,
    pub name: String,
    /// Raw register words as hex, present on successful reads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// One completed poll cycle of one device, emitted as a single event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub device_name: String,
    /// Emission timestamp, epoch milliseconds
    pub timestamp: i64,
    pub registers: BTreeMap<String, RegisterReading>,
}

/// Protocol family a poll task serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Rtu,
    Tcp,
}

impl Family {
    fn matches(&self, device: &DeviceConfig) -> bool {
        device.transport.is_rtu() == matches!(self, Family::Rtu)
    }

    fn tag(&self) -> &'static str {
        match self {
            Family::Rtu => "RTU",
            Family::Tcp => "TCP",
        }
    }
}

/// Outcome of one batch, before health accounting.
pub struct BatchOutcome {
    pub record: TelemetryRecord,
    /// At least one register read succeeded
    pub device_success: bool,
    /// Median successful round-trip in milliseconds
    pub response_ms: Option<u64>,
    /// The batch was cut short by the pause flag
    pub aborted: bool,
    /// Failure summary for the health detail field
    pub failure_detail: String,
}

pub struct PollingEngine {
    config: Arc<ConfigStore>,
    source: Arc<dyn RegisterSource>,
    health: Arc<HealthRegistry>,
    queue: Arc<TelemetryQueue>,
    flags: Arc<ControlFlags>,
}

impl PollingEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        source: Arc<dyn RegisterSource>,
        health: Arc<HealthRegistry>,
        queue: Arc<TelemetryQueue>,
        flags: Arc<ControlFlags>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            source,
            health,
            queue,
            flags,
        })
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    /// Spawn the per-family poll tasks and the auto-recovery task.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.clone().poll_family(Family::Rtu)),
            tokio::spawn(self.clone().poll_family(Family::Tcp)),
        ];
        handles.push(recovery::spawn_recovery_task(
            self.config.clone(),
            self.source.clone(),
            self.health.clone(),
            self.flags.clone(),
        ));
        handles
    }

    async fn poll_family(self: Arc<Self>, family: Family) {
        let mut watch_rx = self.config.subscribe();
        let mut snapshot = self.config.snapshot();
        let mut schedule: HashMap<String, Instant> = HashMap::new();

        self.reconcile(&snapshot, family, &mut schedule);
        tlog!(
            "[Poll:{}] Task started, {} device(s) in family",
            family.tag(),
            snapshot.devices.iter().filter(|d| family.matches(d)).count()
        );

        loop {
            if self.flags.stopped() {
                break;
            }

            // Wake on the earliest schedule entry or a config change,
            // whichever comes first.
            let wait = self.next_wait(&snapshot, family, &schedule);
            tokio::select! {
                changed = watch_rx.changed() => {
                    if changed.is_err() {
                        break; // config store dropped: shutting down
                    }
                    snapshot = self.config.snapshot();
                    self.reconcile(&snapshot, family, &mut schedule);
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
                _ = self.flags.wait_stopped() => break,
            }

            if self.flags.ble_command_active() {
                tokio::time::sleep(PAUSE_SLICE).await;
                continue;
            }

            let now = Instant::now();
            let due: Vec<DeviceConfig> = snapshot
                .devices
                .iter()
                .filter(|d| family.matches(d))
                .filter(|d| self.health.is_enabled(&d.device_id))
                .filter(|d| {
                    schedule
                        .get(&d.device_id)
                        .map(|at| *at <= now)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            for device in due {
                if self.flags.stopped() || self.flags.ble_command_active() {
                    break;
                }
                let outcome = run_batch(&*self.source, &self.flags, &device).await;
                self.finish_batch(&device, outcome);
                schedule.insert(
                    device.device_id.clone(),
                    Instant::now() + Duration::from_millis(device.refresh_rate_ms),
                );
            }
        }

        tlog!("[Poll:{}] Task stopped", family.tag());
    }

    /// Apply a config snapshot to the runtime state: health entries follow
    /// the device list, schedules of removed devices are cancelled, and
    /// surviving devices keep both their health and their next poll slot.
    fn reconcile(
        &self,
        snapshot: &crate::config::ConfigSnapshot,
        family: Family,
        schedule: &mut HashMap<String, Instant>,
    ) {
        let all_ids: Vec<String> = snapshot
            .devices
            .iter()
            .map(|d| d.device_id.clone())
            .collect();
        let (created, removed) = self.health.reconcile(&all_ids);
        if created > 0 || removed > 0 {
            tlog!(
                "[Poll:{}] Reconciled config v{}: {} device(s) added, {} removed",
                family.tag(),
                snapshot.version,
                created,
                removed
            );
        }

        let family_ids: Vec<&str> = snapshot
            .devices
            .iter()
            .filter(|d| family.matches(d))
            .map(|d| d.device_id.as_str())
            .collect();
        schedule.retain(|id, _| family_ids.contains(&id.as_str()));
    }

    fn next_wait(
        &self,
        snapshot: &crate::config::ConfigSnapshot,
        family: Family,
        schedule: &HashMap<String, Instant>,
    ) -> Duration {
        let now = Instant::now();
        snapshot
            .devices
            .iter()
            .filter(|d| family.matches(d))
            .filter(|d| self.health.is_enabled(&d.device_id))
            .map(|d| {
                schedule
                    .get(&d.device_id)
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO)
            })
            .min()
            .unwrap_or(IDLE_WAIT)
    }

    /// Health accounting and emission for one finished batch.
    fn finish_batch(&self, device: &DeviceConfig, outcome: BatchOutcome) {
        if outcome.device_success {
            self.health
                .record_batch_success(&device.device_id, outcome.response_ms);
        } else if !outcome.aborted {
            let transitioned = self.health.record_batch_failure(
                &device.device_id,
                device.retry_count,
                &outcome.failure_detail,
            );
            if transitioned {
                tlog!(
                    "[Poll] Device {} '{}' auto-disabled after {} consecutive failures: {}",
                    device.device_id,
                    device.device_name,
                    device.retry_count,
                    outcome.failure_detail
                );
            }
        }
        self.queue.push(outcome.record);
    }
}

/// Execute one batch: read every configured register of `device` in address
/// order, retrying transient failures up to the device retry budget.
/// Per-register failure marks that register FAIL and never aborts the batch.
pub async fn run_batch(
    source: &dyn RegisterSource,
    flags: &ControlFlags,
    device: &DeviceConfig,
) -> BatchOutcome {
    let mut registers = device.registers.clone();
    registers.sort_by_key(|r| (r.address, r.function_code));

    let mut readings: BTreeMap<String, RegisterReading> = BTreeMap::new();
    let mut response_times: Vec<u64> = Vec::new();
    let mut aborted = false;
    let mut failure_detail = String::new();

    for register in &registers {
        // The configuration channel takes priority over the scan
        if flags.ble_command_active() {
            aborted = true;
            break;
        }

        // One initial attempt plus up to retry_count retransmits
        let attempts = device.retry_count + 1;
        let mut reading = None;

        for attempt in 0..attempts {
            let started = Instant::now();
            match source.read_register(device, register).await {
                Ok(words) => match register.data_type.decode(&words) {
                    Ok(decoded) => {
                        let elapsed = started.elapsed().as_millis() as u64;
                        response_times.push(elapsed);
                        reading = Some(RegisterReading {
                            value: crate::modbus::apply_scaling(
                                decoded,
                                register.scale,
                                register.offset,
                            ),
                            quality: Quality::Ok,
                            unit: register.unit.clone(),
                            name: register.register_name.clone(),
                            raw: Some(words_to_hex(&words)),
                        });
                        break;
                    }
                    Err(e) => {
                        // Decode mismatch is a configuration problem; no retry
                        tlog!(
                            "[Poll] Device {} register {}: {}",
                            device.device_id,
                            register.register_id,
                            e
                        );
                        failure_detail = e.to_string();
                        break;
                    }
                },
                Err(e) => {
                    failure_detail = e.to_string();
                    if !e.is_transient() {
                        tlog!(
                            "[Poll] Device {} register {}: protocol error: {}",
                            device.device_id,
                            register.register_id,
                            e
                        );
                        break;
                    }
                    tdbg!(
                        "poll",
                        "[Poll] Device {} register {} attempt {}/{}: {}",
                        device.device_id,
                        register.register_id,
                        attempt + 1,
                        attempts,
                        e
                    );
                }
            }
        }

        readings.insert(
            register.register_id.clone(),
            reading.unwrap_or_else(|| RegisterReading {
                value: 0.0,
                quality: Quality::Fail,
                unit: register.unit.clone(),
                name: register.register_name.clone(),
                raw: None,
            }),
        );
    }

    // Registers skipped by an abort are reported STALE so the record still
    // carries one entry per configured register.
    for register in &registers {
        readings.entry(register.register_id.clone()).or_insert_with(|| RegisterReading {
            value: 0.0,
            quality: Quality::Stale,
            unit: register.unit.clone(),
            name: register.register_name.clone(),
            raw: None,
        });
    }

    let device_success = readings.values().any(|r| r.quality == Quality::Ok);
    let response_ms = median(&mut response_times);

    BatchOutcome {
        record: TelemetryRecord {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            registers: readings,
        },
        device_success,
        response_ms,
        aborted,
        failure_detail,
    }
}

fn words_to_hex(words: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in words {
        bytes.push((w >> 8) as u8);
        bytes.push((w & 0xFF) as u8);
    }
    hex::encode(bytes)
}

fn median(times: &mut Vec<u64>) -> Option<u64> {
    if times.is_empty() {
        return None;
    }
    times.sort_unstable();
    let mid = times.len() / 2;
    if times.len() % 2 == 1 {
        Some(times[mid])
    } else {
        Some((times[mid - 1] + times[mid]) / 2)
    }
}
