// src/control.rs
//
// Operator control surface. The BLE/configuration handler calls these RPCs;
// the core only sees the resulting config mutations and health commands.

use std::sync::Arc;

use crate::config::types::{DeviceConfig, LoggingConfig, RegisterConfig, ServerConfig};
use crate::config::ConfigStore;
use crate::error::ConfigError;
use crate::poll::health::{DeviceStatus, HealthRegistry};

pub struct ControlSurface {
    config: Arc<ConfigStore>,
    health: Arc<HealthRegistry>,
}

impl ControlSurface {
    pub fn new(config: Arc<ConfigStore>, health: Arc<HealthRegistry>) -> Self {
        Self { config, health }
    }

    // ------------------------------------------------------------------
    // Configuration CRUD
    // ------------------------------------------------------------------

    pub fn create_device(&self, device: DeviceConfig) -> Result<(), ConfigError> {
        self.config.create_device(device)
    }

    pub fn update_device(&self, device_id: &str, patch: DeviceConfig) -> Result<(), ConfigError> {
        self.config.update_device(device_id, patch)
    }

    pub fn delete_device(&self, device_id: &str) -> Result<(), ConfigError> {
        self.config.delete_device(device_id)
    }

    pub fn create_register(
        &self,
        device_id: &str,
        register: RegisterConfig,
    ) -> Result<(), ConfigError> {
        self.config.create_register(device_id, register)
    }

    pub fn update_register(
        &self,
        device_id: &str,
        register_id: &str,
        patch: RegisterConfig,
    ) -> Result<(), ConfigError> {
        self.config.update_register(device_id, register_id, patch)
    }

    pub fn delete_register(&self, device_id: &str, register_id: &str) -> Result<(), ConfigError> {
        self.config.delete_register(device_id, register_id)
    }

    pub fn update_server_config(&self, server: ServerConfig) -> Result<(), ConfigError> {
        self.config.update_server_config(server)
    }

    pub fn update_logging_config(&self, logging: LoggingConfig) -> Result<(), ConfigError> {
        self.config.update_logging_config(logging)
    }

    // ------------------------------------------------------------------
    // Device health commands
    // ------------------------------------------------------------------

    /// Re-enable a disabled device (works for manual and both auto states).
    pub fn enable_device(&self, device_id: &str, clear_metrics: bool) -> Result<(), ConfigError> {
        if self.config.snapshot().device(device_id).is_none() {
            return Err(ConfigError::UnknownId(device_id.to_string()));
        }
        if !self.health.manual_enable(device_id, clear_metrics) {
            return Err(ConfigError::UnknownId(device_id.to_string()));
        }
        tlog!("[Control] Device {} enabled (clear_metrics={})", device_id, clear_metrics);
        Ok(())
    }

    /// Stop polling a device without removing its configuration.
    pub fn disable_device(&self, device_id: &str, reason_detail: &str) -> Result<(), ConfigError> {
        if self.config.snapshot().device(device_id).is_none() {
            return Err(ConfigError::UnknownId(device_id.to_string()));
        }
        if !self.health.manual_disable(device_id, reason_detail) {
            return Err(ConfigError::UnknownId(device_id.to_string()));
        }
        tlog!("[Control] Device {} disabled: {}", device_id, reason_detail);
        Ok(())
    }

    pub fn get_device_status(&self, device_id: &str) -> Result<DeviceStatus, ConfigError> {
        self.health
            .status(device_id)
            .ok_or_else(|| ConfigError::UnknownId(device_id.to_string()))
    }

    pub fn get_all_devices_status(&self) -> Vec<DeviceStatus> {
        self.health.all_statuses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::health::DisableReason;
    use crate::poll::tests::{register, rtu_device};
    use crate::modbus::DataType;

    fn surface(dir: &std::path::Path) -> ControlSurface {
        let config = Arc::new(ConfigStore::load(dir).unwrap());
        let health = Arc::new(HealthRegistry::new());
        let surface = ControlSurface::new(config, health);
        surface
            .create_device(rtu_device("AA0001", vec![register("R1", 0, DataType::Int16)]))
            .unwrap();
        surface.health.reconcile(&["AA0001".to_string()]);
        surface
    }

    #[test]
    fn test_disable_enable_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface(dir.path());

        surface.disable_device("AA0001", "maintenance window").unwrap();
        let status = surface.get_device_status("AA0001").unwrap();
        assert!(!status.enabled);
        assert_eq!(status.disable_reason, DisableReason::Manual);
        assert_eq!(status.disable_detail, "maintenance window");

        surface.enable_device("AA0001", false).unwrap();
        assert!(surface.get_device_status("AA0001").unwrap().enabled);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface(dir.path());

        assert!(matches!(
            surface.enable_device("ZZZZZZ", false),
            Err(ConfigError::UnknownId(_))
        ));
        assert!(matches!(
            surface.get_device_status("ZZZZZZ"),
            Err(ConfigError::UnknownId(_))
        ));
    }

    #[test]
    fn test_status_listing() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface(dir.path());
        surface
            .create_device(rtu_device("BB0002", vec![]))
            .unwrap();
        surface
            .health
            .reconcile(&["AA0001".to_string(), "BB0002".to_string()]);

        let statuses = surface.get_all_devices_status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].device_id, "AA0001");
        assert_eq!(statuses[1].device_id, "BB0002");
    }
}
