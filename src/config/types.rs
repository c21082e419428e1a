// src/config/types.rs
//
// Configuration documents persisted as JSON: devices.json, server_config.json
// and logging.json. Field names match the on-disk format.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::modbus::DataType;

// ============================================================================
// Devices
// ============================================================================

/// Serial parity setting for RTU devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Transport-specific device fields, tagged by the `protocol` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "UPPERCASE")]
pub enum TransportConfig {
    Rtu {
        /// Serial port ordinal (index into the platform's port table)
        serial_port: u8,
        /// Slave address (1-247)
        slave_address: u8,
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_parity")]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    Tcp {
        /// IPv4 address or hostname
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        /// Modbus unit/slave id (1-247)
        unit_id: u8,
    },
}

fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> Parity {
    Parity::None
}
fn default_stop_bits() -> u8 {
    1
}
fn default_modbus_port() -> u16 {
    502
}

impl TransportConfig {
    /// Slave/unit id regardless of transport.
    pub fn slave_id(&self) -> u8 {
        match self {
            TransportConfig::Rtu { slave_address, .. } => *slave_address,
            TransportConfig::Tcp { unit_id, .. } => *unit_id,
        }
    }

    pub fn is_rtu(&self) -> bool {
        matches!(self, TransportConfig::Rtu { .. })
    }
}

/// One polled register belonging to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub register_id: String,
    pub register_name: String,
    /// Modbus function code 1-4
    pub function_code: u8,
    /// Protocol-level start address (0-based)
    pub address: u16,
    pub data_type: DataType,
    /// Advisory per-register cadence; the batch scheduler polls all registers
    /// at the device cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_rate_ms: Option<u64>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterConfig {
    /// Address range occupied by this register: `[address, address + width)`.
    pub fn address_span(&self) -> (u16, u32) {
        (self.address, self.address as u32 + self.data_type.word_count() as u32)
    }
}

/// A polled field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identity: 6 hex characters, unique across the store
    pub device_id: String,
    pub device_name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Poll cadence in milliseconds (>= 100)
    pub refresh_rate_ms: u64,
    /// Per-request timeout in milliseconds
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// Retransmits per register before marking it failed; also the
    /// consecutive-failure limit before auto-disable
    pub retry_count: u32,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level devices.json document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesDocument {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommMode {
    Eth,
    Wifi,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EthernetConfig {
    #[serde(default = "default_true")]
    pub dhcp: bool,
    #[serde(default)]
    pub static_ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
}

fn default_true() -> bool {
    true
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            dhcp: true,
            static_ip: String::new(),
            netmask: String::new(),
            gateway: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationConfig {
    pub mode: CommMode,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub ethernet: EthernetConfig,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            mode: CommMode::Eth,
            wifi: WifiConfig::default(),
            ethernet: EthernetConfig::default(),
        }
    }
}

/// Which northbound publishers are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    Mqtt,
    Http,
    Both,
}

impl ServerProtocol {
    pub fn mqtt_enabled(&self) -> bool {
        matches!(self, ServerProtocol::Mqtt | ServerProtocol::Both)
    }
    pub fn http_enabled(&self) -> bool {
        matches!(self, ServerProtocol::Http | ServerProtocol::Both)
    }
}

/// Publish interval with its configured unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    pub value: u64,
    pub unit: IntervalUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Ms,
    S,
    M,
}

impl IntervalSpec {
    pub fn as_duration(&self) -> Duration {
        match self.unit {
            IntervalUnit::Ms => Duration::from_millis(self.value),
            IntervalUnit::S => Duration::from_secs(self.value),
            IntervalUnit::M => Duration::from_secs(self.value * 60),
        }
    }
}

impl Default for IntervalSpec {
    fn default() -> Self {
        Self {
            value: 10,
            unit: IntervalUnit::S,
        }
    }
}

/// MQTT publish mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Default,
    Customize,
}

/// Default mode: the whole record on one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultModeConfig {
    pub topic_publish: String,
    #[serde(default)]
    pub interval: IntervalSpec,
}

impl Default for DefaultModeConfig {
    fn default() -> Self {
        Self {
            topic_publish: "fieldgate/telemetry".to_string(),
            interval: IntervalSpec::default(),
        }
    }
}

/// Customize mode: named topics each carrying a register subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTopic {
    pub topic: String,
    pub register_ids: Vec<String>,
    #[serde(default)]
    pub interval: IntervalSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomizeModeConfig {
    #[serde(default)]
    pub custom_topics: Vec<CustomTopic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    /// Device MAC; the client id is derived from it
    #[serde(default)]
    pub client_mac: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub persistent_session: bool,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_publish_mode")]
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub default_mode: DefaultModeConfig,
    #[serde(default)]
    pub customize_mode: CustomizeModeConfig,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_publish_mode() -> PublishMode {
    PublishMode::Default
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: default_mqtt_port(),
            client_mac: String::new(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: default_keep_alive(),
            qos: 0,
            persistent_session: false,
            tls: false,
            publish_mode: default_publish_mode(),
            default_mode: DefaultModeConfig::default(),
            customize_mode: CustomizeModeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpBodyFormat {
    Json,
    Form,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub endpoint_url: String,
    #[serde(default = "default_http_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_body_format")]
    pub body_format: HttpBodyFormat,
    #[serde(default)]
    pub interval: IntervalSpec,
    /// Request timeout in milliseconds
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
    /// Attempts per record (1s, 2s, 4s backoff between them)
    #[serde(default = "default_http_retry")]
    pub retry: u32,
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Post
}
fn default_body_format() -> HttpBodyFormat {
    HttpBodyFormat::Json
}
fn default_http_timeout() -> u64 {
    5000
}
fn default_http_retry() -> u32 {
    3
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            method: default_http_method(),
            headers: HashMap::new(),
            body_format: default_body_format(),
            interval: IntervalSpec::default(),
            timeout: default_http_timeout(),
            retry: default_http_retry(),
        }
    }
}

/// Top-level server_config.json document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default = "default_server_protocol")]
    pub protocol: ServerProtocol,
    #[serde(default)]
    pub mqtt_config: MqttConfig,
    #[serde(default)]
    pub http_config: HttpConfig,
}

fn default_server_protocol() -> ServerProtocol {
    ServerProtocol::Mqtt
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            communication: CommunicationConfig::default(),
            protocol: default_server_protocol(),
            mqtt_config: MqttConfig::default(),
            http_config: HttpConfig::default(),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log severity. Ordering matters: a message passes when its level is at or
/// below the configured level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Top-level logging.json document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module switches; absent modules are enabled
    #[serde(default)]
    pub modules: HashMap<String, bool>,
    /// Log files kept on disk (0 = unlimited)
    #[serde(default = "default_retention")]
    pub retention: u32,
    /// Periodic status-summary interval in seconds (0 = disabled)
    #[serde(default)]
    pub interval: u64,
    /// Prefix log lines with full RTC date instead of time-of-day
    #[serde(default)]
    pub rtc_timestamps: bool,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_retention() -> u32 {
    10
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            modules: HashMap::new(),
            retention: default_retention(),
            interval: 0,
            rtc_timestamps: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_json_roundtrip() {
        let json = r#"{
            "device_id": "D4A5F1",
            "device_name": "Boiler PLC",
            "protocol": "TCP",
            "host": "192.168.1.40",
            "port": 502,
            "unit_id": 1,
            "refresh_rate_ms": 1000,
            "timeout": 500,
            "retry_count": 3,
            "registers": [{
                "register_id": "R1",
                "register_name": "temperature",
                "function_code": 3,
                "address": 1,
                "data_type": "int16",
                "scale": 0.1,
                "unit": "C"
            }]
        }"#;
        let device: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(device.device_id, "D4A5F1");
        assert!(matches!(device.transport, TransportConfig::Tcp { .. }));
        assert_eq!(device.transport.slave_id(), 1);
        assert_eq!(device.timeout_ms, 500);
        assert_eq!(device.registers[0].scale, 0.1);
        assert_eq!(device.registers[0].offset, 0.0);

        let back = serde_json::to_value(&device).unwrap();
        assert_eq!(back["protocol"], "TCP");
        assert_eq!(back["timeout"], 500);

        let again: DeviceConfig = serde_json::from_value(back).unwrap();
        assert_eq!(again, device);
    }

    #[test]
    fn test_rtu_device_defaults() {
        let json = r#"{
            "device_id": "A1B2C3",
            "device_name": "Flow meter",
            "protocol": "RTU",
            "serial_port": 0,
            "slave_address": 7,
            "baud_rate": 9600,
            "refresh_rate_ms": 2000,
            "timeout": 300,
            "retry_count": 2
        }"#;
        let device: DeviceConfig = serde_json::from_str(json).unwrap();
        match device.transport {
            TransportConfig::Rtu {
                data_bits,
                parity,
                stop_bits,
                ..
            } => {
                assert_eq!(data_bits, 8);
                assert_eq!(parity, Parity::None);
                assert_eq!(stop_bits, 1);
            }
            _ => panic!("expected RTU transport"),
        }
        assert!(device.registers.is_empty());
    }

    #[test]
    fn test_interval_units() {
        let ms = IntervalSpec { value: 250, unit: IntervalUnit::Ms };
        let s = IntervalSpec { value: 5, unit: IntervalUnit::S };
        let m = IntervalSpec { value: 2, unit: IntervalUnit::M };
        assert_eq!(ms.as_duration(), Duration::from_millis(250));
        assert_eq!(s.as_duration(), Duration::from_secs(5));
        assert_eq!(m.as_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.protocol, ServerProtocol::Mqtt);
        assert!(cfg.protocol.mqtt_enabled());
        assert!(!cfg.protocol.http_enabled());
        assert_eq!(cfg.mqtt_config.broker_port, 1883);
        assert_eq!(cfg.http_config.retry, 3);
    }

    #[test]
    fn test_address_span() {
        let reg = RegisterConfig {
            register_id: "R1".into(),
            register_name: "x".into(),
            function_code: 3,
            address: 10,
            data_type: DataType::Double64Be,
            refresh_rate_ms: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            description: String::new(),
        };
        assert_eq!(reg.address_span(), (10, 14));
    }
}
