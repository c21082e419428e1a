// src/error.rs
//
// Error types for every subsystem, plus the unified numeric error codes
// reported on the log/status channel.
//
// Code domains:
//   Network 0-99, MQTT 100-199, BLE 200-299 (owned by the platform layer),
//   Modbus 300-399, Memory 400-499, Config 500-599, System 600-699.

use thiserror::Error;

// ============================================================================
// Config / Persistence
// ============================================================================

/// Errors from configuration mutations and persistence.
/// All are non-fatal: the caller's previous snapshot remains valid and no
/// in-memory state changes until a commit succeeds.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The mutation failed validation. Nothing touched disk.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Serializing the target document failed.
    #[error("failed to serialize document: {0}")]
    SerializeFailed(String),

    /// Writing or flushing the temp file failed.
    #[error("failed to write temp file {path}: {source}")]
    TempWriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The commit rename failed. The temp file is left for recovery.
    #[error("failed to rename {from} -> {to}: {source}")]
    RenameFailed {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },

    /// The written temp file did not read back as expected.
    #[error("integrity check failed for {0}")]
    IntegrityFailed(String),

    /// Underlying filesystem error outside the atomic-write path.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced device or register does not exist.
    #[error("unknown id: {0}")]
    UnknownId(String),
}

impl ConfigError {
    pub fn error_code(&self) -> u16 {
        match self {
            ConfigError::Validation(_) => 510,
            ConfigError::SerializeFailed(_) => 520,
            ConfigError::TempWriteFailed { .. } => 530,
            ConfigError::RenameFailed { .. } => 531,
            ConfigError::IntegrityFailed(_) => 532,
            ConfigError::Io(_) => 540,
            ConfigError::UnknownId(_) => 550,
        }
    }
}

// ============================================================================
// Modbus Codec
// ============================================================================

/// Frame-level and decode-level errors. Protocol errors (everything except
/// `ModbusException`) indicate a misconfigured peer and are never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("invalid CRC: expected {expected:#06x}, got {actual:#06x}")]
    InvalidCrc { expected: u16, actual: u16 },

    #[error("invalid MBAP header: {0}")]
    InvalidMbap(String),

    #[error("short frame: needed {needed} bytes, got {got}")]
    ShortFrame { needed: usize, got: usize },

    #[error("wrong function code: expected {expected:#04x}, got {actual:#04x}")]
    WrongFunction { expected: u8, actual: u8 },

    /// The slave answered with a Modbus exception frame.
    #[error("modbus exception {0:#04x} ({})", crate::modbus::exception_name(*.0))]
    ModbusException(u8),

    #[error("unsupported data type for {0} register words")]
    UnsupportedDataType(String),
}

impl CodecError {
    pub fn error_code(&self) -> u16 {
        match self {
            CodecError::InvalidCrc { .. } => 310,
            CodecError::InvalidMbap(_) => 311,
            CodecError::ShortFrame { .. } => 312,
            CodecError::WrongFunction { .. } => 313,
            CodecError::ModbusException(code) => 320 + (*code as u16).min(79),
            CodecError::UnsupportedDataType(_) => 314,
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Errors moving request/response bytes to and from a device.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    #[error("read timeout after {0} ms")]
    ReadTimeout(u64),

    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The serial port mutex was held past the acquire timeout.
    #[error("serial port {0} busy")]
    PortBusy(u8),

    /// Every pool slot is checked out or owned by another endpoint.
    #[error("tcp connection pool exhausted")]
    PoolExhausted,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("serial error on port {port}: {detail}")]
    Serial { port: u8, detail: String },
}

impl TransportError {
    /// Transient errors are retried up to the device's retry budget.
    /// Protocol errors mean the peer is misconfigured: log, mark FAIL, move on.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectTimeout(_)
            | TransportError::ReadTimeout(_)
            | TransportError::WriteFailed(_)
            | TransportError::PortBusy(_)
            | TransportError::PoolExhausted
            | TransportError::Serial { .. } => true,
            TransportError::Codec(c) => matches!(c, CodecError::ModbusException(_)),
        }
    }

    pub fn error_code(&self) -> u16 {
        match self {
            TransportError::ConnectTimeout(_) => 10,
            TransportError::ReadTimeout(_) => 11,
            TransportError::WriteFailed(_) => 12,
            TransportError::PortBusy(_) => 300,
            TransportError::PoolExhausted => 13,
            TransportError::Codec(c) => c.error_code(),
            TransportError::Serial { .. } => 301,
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Errors delivering telemetry northbound.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt disconnected")]
    MqttDisconnected,

    #[error("mqtt authentication failed")]
    MqttAuthFailed,

    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("http transport failed: {0}")]
    HttpTransportFailed(String),

    #[error("http returned status {0}")]
    HttpNon2xx(u16),

    #[error("failed to serialize payload: {0}")]
    SerializeFailed(String),
}

impl PublishError {
    pub fn error_code(&self) -> u16 {
        match self {
            PublishError::MqttDisconnected => 110,
            PublishError::MqttAuthFailed => 111,
            PublishError::TlsHandshakeFailed(_) => 112,
            PublishError::HttpTransportFailed(_) => 20,
            PublishError::HttpNon2xx(_) => 21,
            PublishError::SerializeFailed(_) => 610,
        }
    }
}
