// src/lib.rs
//
// fieldgate: industrial IoT gateway core. Polls Modbus field devices (serial
// RTU and TCP) on per-device cadences, decodes register values into telemetry
// records, and forwards them northbound over MQTT and HTTP.
//
// `Gateway` is the composition root: it wires the config store, transport,
// polling engine and publishers together at startup and owns their task
// handles. Nothing here is a process-wide singleton except the log sink.

#[macro_use]
pub(crate) mod logging;

pub mod config;
pub mod control;
pub mod error;
pub mod modbus;
pub mod poll;
pub mod publish;
pub mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use config::ConfigStore;
use control::ControlSurface;
use error::ConfigError;
use poll::health::HealthRegistry;
use poll::PollingEngine;
use publish::TelemetryQueue;
use transport::{ModbusLink, RtuBus, TcpPool};

/// Time each task gets to drain its current batch on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Process-wide run flags shared by every task.
///
/// `ble_command_active` is asserted by the external configuration/BLE handler
/// while it processes a user command; the polling engine and publishers pause
/// outbound I/O at their defined suspension points until it clears.
pub struct ControlFlags {
    ble_command_active: AtomicBool,
    stop: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self {
            ble_command_active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub fn ble_command_active(&self) -> bool {
        self.ble_command_active.load(Ordering::Relaxed)
    }

    pub fn set_ble_command_active(&self, active: bool) {
        self.ble_command_active.store(active, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Resolve once `request_stop` has been called. Interval tasks select
    /// against this so shutdown is not gated on their next tick.
    pub async fn wait_stopped(&self) {
        while !self.stopped() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled gateway: configuration, transport, engine and publishers.
pub struct Gateway {
    config: Arc<ConfigStore>,
    health: Arc<HealthRegistry>,
    flags: Arc<ControlFlags>,
    queue: Arc<TelemetryQueue>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Gateway {
    /// Wire everything and spawn the background tasks.
    /// `serial_ports` maps RTU port ordinals to platform device paths.
    pub fn start(
        storage_root: PathBuf,
        serial_ports: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let config = Arc::new(ConfigStore::load(&storage_root)?);
        let snapshot = config.snapshot();
        logging::configure(&snapshot.logging);

        let flags = Arc::new(ControlFlags::new());
        let health = Arc::new(HealthRegistry::new());
        let queue = Arc::new(TelemetryQueue::default());

        let pool = Arc::new(TcpPool::new());
        let link = Arc::new(ModbusLink::new(RtuBus::new(serial_ports), pool.clone()));

        let engine = PollingEngine::new(
            config.clone(),
            link,
            health.clone(),
            queue.clone(),
            flags.clone(),
        );

        let mut handles = engine.spawn_tasks();
        handles.push(transport::spawn_maintenance_task(pool, flags.clone()));
        handles.extend(publish::spawn_publisher_tasks(
            &snapshot.server,
            queue.clone(),
            flags.clone(),
        ));

        if snapshot.logging.interval > 0 {
            handles.push(spawn_stats_task(
                health.clone(),
                queue.clone(),
                flags.clone(),
                Duration::from_secs(snapshot.logging.interval),
            ));
        }

        tlog!(
            "[Gateway] Started: {} device(s), protocol {:?}",
            snapshot.devices.len(),
            snapshot.server.protocol
        );

        Ok(Self {
            config,
            health,
            flags,
            queue,
            handles,
        })
    }

    /// The control surface handed to the BLE/configuration handler.
    pub fn control(&self) -> ControlSurface {
        ControlSurface::new(self.config.clone(), self.health.clone())
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn config(&self) -> Arc<ConfigStore> {
        self.config.clone()
    }

    /// Stop every task: each drains its current batch, not its schedule.
    pub async fn shutdown(self) {
        tlog!("[Gateway] Shutting down");
        self.flags.request_stop();

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, join_all(self.handles)).await;
        if joined.is_err() {
            tlog!("[Gateway] Shutdown grace period elapsed with tasks still running");
        }

        let dropped = self.queue.dropped_count();
        if dropped > 0 {
            tlog!("[Gateway] {} telemetry record(s) dropped under backpressure", dropped);
        }
        logging::stop_file_logging();
    }
}

/// Periodic status summary, cadence from logging.json `interval`.
fn spawn_stats_task(
    health: Arc<HealthRegistry>,
    queue: Arc<TelemetryQueue>,
    flags: Arc<ControlFlags>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = flags.wait_stopped() => break,
            }
            let statuses = health.all_statuses();
            let enabled = statuses.iter().filter(|s| s.enabled).count();
            tlog!(
                "[Stats] {} device(s) ({} enabled), queue depth {}, {} dropped",
                statuses.len(),
                enabled,
                queue.len(),
                queue.dropped_count()
            );
        }
    })
}

/// Binary entry point: resolve the storage root, start the gateway, run
/// until interrupted.
pub fn run() {
    let storage_root = std::env::var("FIELDGATE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fieldgate")
        });

    let serial_ports: Vec<String> = std::env::var("FIELDGATE_SERIAL_PORTS")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()]);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    runtime.block_on(async {
        if let Err(e) = logging::init_file_logging(&storage_root.join("logs"), 10) {
            eprintln!("[fieldgate] File logging unavailable: {}", e);
        }

        let gateway = match Gateway::start(storage_root, serial_ports) {
            Ok(gateway) => gateway,
            Err(e) => {
                tlog!("[Gateway] Fatal: failed to start: {} (code {})", e, e.error_code());
                std::process::exit(1);
            }
        };

        match tokio::signal::ctrl_c().await {
            Ok(()) => tlog!("[Gateway] Interrupt received"),
            Err(e) => tlog!("[Gateway] Signal handler failed: {}", e),
        }
        gateway.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flags() {
        let flags = ControlFlags::new();
        assert!(!flags.ble_command_active());
        assert!(!flags.stopped());

        flags.set_ble_command_active(true);
        assert!(flags.ble_command_active());
        flags.set_ble_command_active(false);
        assert!(!flags.ble_command_active());

        flags.request_stop();
        assert!(flags.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gateway_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::start(dir.path().to_path_buf(), vec![]).unwrap();

        let control = gateway.control();
        assert!(control.get_all_devices_status().is_empty());

        gateway.shutdown().await;
    }
}
