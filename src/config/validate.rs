// src/config/validate.rs
//
// Pre-commit validation. Every rule here runs before anything touches disk;
// a rejected mutation leaves both memory and files untouched.

use crate::config::types::{DeviceConfig, RegisterConfig, TransportConfig};
use crate::error::ConfigError;

/// Minimum poll cadence.
pub const MIN_REFRESH_RATE_MS: u64 = 100;

/// Valid Modbus slave/unit id range.
pub const SLAVE_ID_MIN: u8 = 1;
pub const SLAVE_ID_MAX: u8 = 247;

fn err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Device id: exactly 6 hex characters.
pub fn validate_device_id(id: &str) -> Result<(), ConfigError> {
    if id.len() != 6 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(err(format!(
            "device_id '{}' must be exactly 6 hex characters",
            id
        )));
    }
    Ok(())
}

/// Validate a device in the context of its siblings.
pub fn validate_device(device: &DeviceConfig, others: &[DeviceConfig]) -> Result<(), ConfigError> {
    validate_device_id(&device.device_id)?;

    if device.device_name.trim().is_empty() {
        return Err(err("device_name must not be empty"));
    }

    if others.iter().any(|d| d.device_id == device.device_id) {
        return Err(err(format!("duplicate device_id '{}'", device.device_id)));
    }

    if device.refresh_rate_ms < MIN_REFRESH_RATE_MS {
        return Err(err(format!(
            "refresh_rate_ms {} below minimum {}",
            device.refresh_rate_ms, MIN_REFRESH_RATE_MS
        )));
    }

    if device.timeout_ms == 0 {
        return Err(err("timeout must be greater than zero"));
    }

    let slave = device.transport.slave_id();
    if !(SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave) {
        return Err(err(format!(
            "slave id {} outside {}-{}",
            slave, SLAVE_ID_MIN, SLAVE_ID_MAX
        )));
    }

    match &device.transport {
        TransportConfig::Rtu {
            baud_rate,
            data_bits,
            stop_bits,
            ..
        } => {
            if *baud_rate == 0 {
                return Err(err("baud_rate must be greater than zero"));
            }
            if !(5..=8).contains(data_bits) {
                return Err(err(format!("data_bits {} outside 5-8", data_bits)));
            }
            if !(1..=2).contains(stop_bits) {
                return Err(err(format!("stop_bits {} outside 1-2", stop_bits)));
            }
        }
        TransportConfig::Tcp { host, port, .. } => {
            if host.trim().is_empty() {
                return Err(err("host must not be empty"));
            }
            if *port == 0 {
                return Err(err("port must be greater than zero"));
            }
        }
    }

    // Registers carried on the device document are validated as a set
    let mut accepted: Vec<RegisterConfig> = Vec::new();
    for reg in &device.registers {
        validate_register(reg, &accepted)?;
        accepted.push(reg.clone());
    }

    Ok(())
}

/// Validate a register in the context of its device's other registers.
pub fn validate_register(
    register: &RegisterConfig,
    siblings: &[RegisterConfig],
) -> Result<(), ConfigError> {
    if register.register_id.trim().is_empty() {
        return Err(err("register_id must not be empty"));
    }

    if siblings.iter().any(|r| r.register_id == register.register_id) {
        return Err(err(format!(
            "duplicate register_id '{}'",
            register.register_id
        )));
    }

    if !(1..=4).contains(&register.function_code) {
        return Err(err(format!(
            "function_code {} outside 1-4",
            register.function_code
        )));
    }

    let (start, end) = register.address_span();
    if end > 0x1_0000 {
        return Err(err(format!(
            "register '{}' spans past address 65535",
            register.register_id
        )));
    }

    if let Some(refresh) = register.refresh_rate_ms {
        if refresh < MIN_REFRESH_RATE_MS {
            return Err(err(format!(
                "register refresh_rate_ms {} below minimum {}",
                refresh, MIN_REFRESH_RATE_MS
            )));
        }
    }

    // Overlap applies within one device + function code only
    for other in siblings.iter().filter(|r| r.function_code == register.function_code) {
        let (o_start, o_end) = other.address_span();
        if (start as u32) < o_end && (o_start as u32) < end {
            return Err(err(format!(
                "register '{}' overlaps '{}' at address {}",
                register.register_id, other.register_id, start
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::DataType;

    fn tcp_device(id: &str, unit: u8) -> DeviceConfig {
        DeviceConfig {
            device_id: id.to_string(),
            device_name: "dev".to_string(),
            transport: TransportConfig::Tcp {
                host: "10.0.0.2".to_string(),
                port: 502,
                unit_id: unit,
            },
            refresh_rate_ms: 1000,
            timeout_ms: 500,
            retry_count: 3,
            registers: Vec::new(),
        }
    }

    fn register(id: &str, fc: u8, address: u16, data_type: DataType) -> RegisterConfig {
        RegisterConfig {
            register_id: id.to_string(),
            register_name: id.to_string(),
            function_code: fc,
            address,
            data_type,
            refresh_rate_ms: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn test_device_id_format() {
        assert!(validate_device_id("D4A5F1").is_ok());
        assert!(validate_device_id("d4a5f1").is_ok());
        assert!(validate_device_id("D4A5F").is_err());
        assert!(validate_device_id("D4A5F1A").is_err());
        assert!(validate_device_id("D4A5GZ").is_err());
    }

    #[test]
    fn test_slave_id_boundaries() {
        assert!(validate_device(&tcp_device("000001", 1), &[]).is_ok());
        assert!(validate_device(&tcp_device("000002", 247), &[]).is_ok());
        assert!(validate_device(&tcp_device("000003", 0), &[]).is_err());
        assert!(validate_device(&tcp_device("000004", 248), &[]).is_err());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let existing = vec![tcp_device("AAAAAA", 1)];
        assert!(validate_device(&tcp_device("AAAAAA", 2), &existing).is_err());
        assert!(validate_device(&tcp_device("BBBBBB", 2), &existing).is_ok());
    }

    #[test]
    fn test_refresh_rate_floor() {
        let mut device = tcp_device("CCCCCC", 1);
        device.refresh_rate_ms = 99;
        assert!(validate_device(&device, &[]).is_err());
        device.refresh_rate_ms = 100;
        assert!(validate_device(&device, &[]).is_ok());
    }

    #[test]
    fn test_register_overlap_same_function_code() {
        let siblings = vec![register("R1", 3, 10, DataType::Float32Be)]; // spans 10..12
        assert!(validate_register(&register("R2", 3, 11, DataType::Int16), &siblings).is_err());
        assert!(validate_register(&register("R3", 3, 12, DataType::Int16), &siblings).is_ok());
        // Different function code may overlap
        assert!(validate_register(&register("R4", 4, 11, DataType::Int16), &siblings).is_ok());
    }

    #[test]
    fn test_register_bounds() {
        assert!(validate_register(&register("R1", 3, 65535, DataType::Int16), &[]).is_ok());
        assert!(validate_register(&register("R2", 3, 65535, DataType::Int32Be), &[]).is_err());
        assert!(validate_register(&register("R3", 5, 0, DataType::Int16), &[]).is_err());
        assert!(validate_register(&register("R4", 0, 0, DataType::Int16), &[]).is_err());
    }

    #[test]
    fn test_duplicate_register_id() {
        let siblings = vec![register("R1", 3, 0, DataType::Int16)];
        assert!(validate_register(&register("R1", 3, 50, DataType::Int16), &siblings).is_err());
    }
}
