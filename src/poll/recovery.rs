// src/poll/recovery.rs
//
// Auto-recovery task. Devices parked in AutoDisabledRetry get one probe per
// backoff interval: a single read of their lowest-addressed register, no
// retransmits. A successful probe re-enables the device; a failed one doubles
// the backoff until the budget is spent and the device times out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::types::{DeviceConfig, RegisterConfig};
use crate::config::ConfigStore;
use crate::modbus::DataType;
use crate::transport::RegisterSource;
use crate::ControlFlags;

use super::health::{HealthRegistry, RETRY_CEILING};

/// Cadence of the recovery scheduler.
const RECOVERY_TICK: Duration = Duration::from_secs(1);

/// Spawn the auto-recovery loop.
pub fn spawn_recovery_task(
    config: Arc<ConfigStore>,
    source: Arc<dyn RegisterSource>,
    health: Arc<HealthRegistry>,
    flags: Arc<ControlFlags>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tlog!("[Recovery] Task started");
        let mut timer = tokio::time::interval(RECOVERY_TICK);
        loop {
            timer.tick().await;
            if flags.stopped() {
                break;
            }
            if flags.ble_command_active() {
                continue;
            }
            run_recovery_tick(&config, &*source, &health, &flags).await;
        }
        tlog!("[Recovery] Task stopped");
    })
}

/// One scheduler pass: probe every device whose retry window has elapsed.
pub async fn run_recovery_tick(
    config: &ConfigStore,
    source: &dyn RegisterSource,
    health: &HealthRegistry,
    flags: &ControlFlags,
) {
    if flags.stopped() || flags.ble_command_active() {
        return;
    }

    let due = health.take_due_probes(Instant::now());
    if due.is_empty() {
        return;
    }

    let snapshot = config.snapshot();
    let mut due = due.into_iter();
    while let Some(device_id) = due.next() {
        if flags.stopped() || flags.ble_command_active() {
            // Give unprobed devices their slot back
            health.reschedule_probe(&device_id);
            for id in due {
                health.reschedule_probe(&id);
            }
            return;
        }
        // Device removed since it was scheduled; reconciliation drops the
        // health entry on the next poll cycle.
        let Some(device) = snapshot.device(&device_id) else {
            continue;
        };

        match probe(source, device).await {
            Ok(()) => {
                health.probe_succeeded(&device_id);
                tlog!(
                    "[Recovery] Device {} '{}' answered probe, re-enabled",
                    device.device_id,
                    device.device_name
                );
            }
            Err(e) => {
                let timed_out = health.probe_failed(&device_id, RETRY_CEILING);
                if timed_out {
                    tlog!(
                        "[Recovery] Device {} '{}' exhausted its probe budget: {}",
                        device.device_id,
                        device.device_name,
                        e
                    );
                } else {
                    tdbg!(
                        "recovery",
                        "[Recovery] Device {} probe failed: {}",
                        device.device_id,
                        e
                    );
                }
            }
        }
    }
}

/// One probe read. Uses the device's lowest-addressed register; devices with
/// no registers probe with a single holding-register read at address 0.
async fn probe(
    source: &dyn RegisterSource,
    device: &DeviceConfig,
) -> Result<(), crate::error::TransportError> {
    let probe_register = device
        .registers
        .iter()
        .min_by_key(|r| r.address)
        .cloned()
        .unwrap_or_else(|| RegisterConfig {
            register_id: "__probe".to_string(),
            register_name: "probe".to_string(),
            function_code: 3,
            address: 0,
            data_type: DataType::Uint16,
            refresh_rate_ms: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            description: String::new(),
        });

    source.read_register(device, &probe_register).await.map(|_| ())
}
