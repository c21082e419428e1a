// src/config/mod.rs
//
// ConfigStore: the authoritative gateway configuration. Owns the persisted
// documents, serves immutable snapshots to the polling/publishing side, and
// broadcasts a version bump on every successful mutation.
//
// Mutations are serialized by one mutex and applied copy-on-write: validate,
// persist atomically, then swap the snapshot pointer. A failed mutation
// leaves both disk and the current snapshot untouched.

pub mod atomic_file;
pub mod types;
pub mod validate;

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;

use crate::error::ConfigError;
use atomic_file::AtomicStore;
use types::{
    DeviceConfig, DevicesDocument, LoggingConfig, RegisterConfig, ServerConfig,
};

pub const DEVICES_FILE: &str = "devices.json";
pub const SERVER_FILE: &str = "server_config.json";
pub const LOGGING_FILE: &str = "logging.json";

/// An immutable view of the full configuration, consistent across all files.
/// Consumers hold the `Arc` for the duration of one cycle.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Bumped on every successful mutation
    pub version: u64,
    pub devices: Vec<DeviceConfig>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl ConfigSnapshot {
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

pub struct ConfigStore {
    store: AtomicStore,
    current: RwLock<Arc<ConfigSnapshot>>,
    /// Serializes mutations; readers never take it
    mutate: Mutex<()>,
    notify: watch::Sender<u64>,
}

impl ConfigStore {
    /// Load the store from `root`, running WAL/temp-file recovery before the
    /// first read. A missing, empty or corrupt file is replaced by its
    /// default without touching the other documents.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let store = AtomicStore::new(root.as_ref());

        let report = store.recover()?;
        if report.orphans_removed > 0 || report.renames_retried > 0 {
            tlog!(
                "[ConfigStore] Recovery: {} orphan temp file(s) removed, {} rename(s) retried",
                report.orphans_removed,
                report.renames_retried
            );
        }

        let devices: DevicesDocument = read_or_default(&store, DEVICES_FILE);
        let server: ServerConfig = read_or_default(&store, SERVER_FILE);
        let logging: LoggingConfig = read_or_default(&store, LOGGING_FILE);

        let snapshot = Arc::new(ConfigSnapshot {
            version: 1,
            devices: devices.devices,
            server,
            logging,
        });

        tlog!(
            "[ConfigStore] Loaded {} device(s) from {}",
            snapshot.devices.len(),
            root.as_ref().display()
        );

        let (notify, _) = watch::channel(snapshot.version);
        Ok(Self {
            store,
            current: RwLock::new(snapshot),
            mutate: Mutex::new(()),
            notify,
        })
    }

    pub fn storage_root(&self) -> &Path {
        self.store.root()
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().expect("snapshot lock poisoned").clone()
    }

    /// Change signal. The value is the snapshot version; it changes on every
    /// successful mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    // ------------------------------------------------------------------
    // Device CRUD
    // ------------------------------------------------------------------

    pub fn create_device(&self, device: DeviceConfig) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        validate::validate_device(&device, &snapshot.devices)?;

        let mut devices = snapshot.devices.clone();
        tlog!(
            "[ConfigStore] Creating device {} '{}'",
            device.device_id,
            device.device_name
        );
        devices.push(device);
        self.commit_devices(&snapshot, devices)
    }

    /// Replace a device's settings. The stored register list is preserved;
    /// registers travel through the register CRUD operations.
    pub fn update_device(&self, device_id: &str, patch: DeviceConfig) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let index = snapshot
            .devices
            .iter()
            .position(|d| d.device_id == device_id)
            .ok_or_else(|| ConfigError::UnknownId(device_id.to_string()))?;

        let mut updated = patch;
        updated.device_id = device_id.to_string();
        updated.registers = snapshot.devices[index].registers.clone();

        let others: Vec<DeviceConfig> = snapshot
            .devices
            .iter()
            .filter(|d| d.device_id != device_id)
            .cloned()
            .collect();
        validate::validate_device(&updated, &others)?;

        let mut devices = snapshot.devices.clone();
        devices[index] = updated;
        self.commit_devices(&snapshot, devices)
    }

    pub fn delete_device(&self, device_id: &str) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let before = snapshot.devices.len();
        let devices: Vec<DeviceConfig> = snapshot
            .devices
            .iter()
            .filter(|d| d.device_id != device_id)
            .cloned()
            .collect();
        if devices.len() == before {
            return Err(ConfigError::UnknownId(device_id.to_string()));
        }

        tlog!("[ConfigStore] Deleting device {}", device_id);
        self.commit_devices(&snapshot, devices)
    }

    // ------------------------------------------------------------------
    // Register CRUD
    // ------------------------------------------------------------------

    pub fn create_register(
        &self,
        device_id: &str,
        register: RegisterConfig,
    ) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let mut devices = snapshot.devices.clone();
        let device = devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| ConfigError::UnknownId(device_id.to_string()))?;

        validate::validate_register(&register, &device.registers)?;
        device.registers.push(register);
        self.commit_devices(&snapshot, devices)
    }

    pub fn update_register(
        &self,
        device_id: &str,
        register_id: &str,
        patch: RegisterConfig,
    ) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let mut devices = snapshot.devices.clone();
        let device = devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| ConfigError::UnknownId(device_id.to_string()))?;

        let index = device
            .registers
            .iter()
            .position(|r| r.register_id == register_id)
            .ok_or_else(|| ConfigError::UnknownId(register_id.to_string()))?;

        let mut updated = patch;
        updated.register_id = register_id.to_string();

        let siblings: Vec<RegisterConfig> = device
            .registers
            .iter()
            .filter(|r| r.register_id != register_id)
            .cloned()
            .collect();
        validate::validate_register(&updated, &siblings)?;

        device.registers[index] = updated;
        self.commit_devices(&snapshot, devices)
    }

    pub fn delete_register(&self, device_id: &str, register_id: &str) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let mut devices = snapshot.devices.clone();
        let device = devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| ConfigError::UnknownId(device_id.to_string()))?;

        let before = device.registers.len();
        device.registers.retain(|r| r.register_id != register_id);
        if device.registers.len() == before {
            return Err(ConfigError::UnknownId(register_id.to_string()));
        }
        self.commit_devices(&snapshot, devices)
    }

    // ------------------------------------------------------------------
    // Server / logging
    // ------------------------------------------------------------------

    /// Persist a new server configuration. Restarting network interfaces to
    /// apply communication-mode changes happens out-of-band.
    pub fn update_server_config(&self, server: ServerConfig) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let bytes = serialize_document(&server)?;
        self.store.write_atomic(SERVER_FILE, &bytes)?;

        self.publish(ConfigSnapshot {
            version: snapshot.version + 1,
            devices: snapshot.devices.clone(),
            server,
            logging: snapshot.logging.clone(),
        });
        Ok(())
    }

    pub fn update_logging_config(&self, logging: LoggingConfig) -> Result<(), ConfigError> {
        let _guard = self.mutate.lock().expect("mutate lock poisoned");
        let snapshot = self.snapshot();

        let bytes = serialize_document(&logging)?;
        self.store.write_atomic(LOGGING_FILE, &bytes)?;

        crate::logging::configure(&logging);
        self.publish(ConfigSnapshot {
            version: snapshot.version + 1,
            devices: snapshot.devices.clone(),
            server: snapshot.server.clone(),
            logging,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit plumbing
    // ------------------------------------------------------------------

    /// Persist a new device list, then swap the snapshot and notify.
    /// Caller holds the mutate lock.
    fn commit_devices(
        &self,
        snapshot: &ConfigSnapshot,
        devices: Vec<DeviceConfig>,
    ) -> Result<(), ConfigError> {
        let document = DevicesDocument {
            devices: devices.clone(),
        };
        let bytes = serialize_document(&document)?;
        self.store.write_atomic(DEVICES_FILE, &bytes)?;

        self.publish(ConfigSnapshot {
            version: snapshot.version + 1,
            devices,
            server: snapshot.server.clone(),
            logging: snapshot.logging.clone(),
        });
        Ok(())
    }

    fn publish(&self, snapshot: ConfigSnapshot) {
        let version = snapshot.version;
        *self.current.write().expect("snapshot lock poisoned") = Arc::new(snapshot);
        // send_replace updates the value even when no subscriber is live yet
        self.notify.send_replace(version);
    }
}

fn serialize_document<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ConfigError> {
    serde_json::to_vec_pretty(value).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
}

/// Parse a stored document, substituting the default when the file is
/// missing, empty or corrupt. Only the affected file falls back.
fn read_or_default<T: serde::de::DeserializeOwned + Default>(
    store: &AtomicStore,
    name: &str,
) -> T {
    match store.read(name) {
        Ok(Some(bytes)) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tlog!("[ConfigStore] {} is corrupt ({}), using defaults", name, e);
                T::default()
            }
        },
        Ok(_) => T::default(),
        Err(e) => {
            tlog!("[ConfigStore] Failed to read {} ({}), using defaults", name, e);
            T::default()
        }
    }
}
