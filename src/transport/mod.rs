// src/transport/mod.rs
//
// Transport layer: moves codec-built frames to devices and returns decoded
// register words. `RegisterSource` is the seam the polling engine drives;
// `ModbusLink` is the live implementation over serial RTU and pooled TCP.

pub mod serial;
pub mod tcp_pool;

use async_trait::async_trait;

use crate::config::types::{DeviceConfig, RegisterConfig, TransportConfig};
use crate::error::TransportError;
use crate::modbus;

pub use serial::{RtuBus, SerialSettings};
pub use tcp_pool::{spawn_maintenance_task, TcpPool};

/// One register read against one device. Implementations own per-medium
/// ordering and timing; callers own retries and health accounting.
#[async_trait]
pub trait RegisterSource: Send + Sync {
    /// Read the register's raw words (one per coil for bit functions).
    async fn read_register(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Live Modbus transport: RTU over the port table, TCP through the pool.
pub struct ModbusLink {
    rtu: RtuBus,
    tcp: std::sync::Arc<TcpPool>,
}

impl ModbusLink {
    pub fn new(rtu: RtuBus, tcp: std::sync::Arc<TcpPool>) -> Self {
        Self { rtu, tcp }
    }

    pub fn tcp_pool(&self) -> std::sync::Arc<TcpPool> {
        self.tcp.clone()
    }
}

#[async_trait]
impl RegisterSource for ModbusLink {
    async fn read_register(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
    ) -> Result<Vec<u16>, TransportError> {
        let quantity = register.data_type.word_count();
        let function = register.function_code;

        match &device.transport {
            TransportConfig::Rtu {
                serial_port,
                slave_address,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let request =
                    modbus::build_rtu_request(*slave_address, function, register.address, quantity);
                let expected = modbus::expected_rtu_response_len(function, quantity);
                let settings = SerialSettings {
                    baud_rate: *baud_rate,
                    data_bits: *data_bits,
                    parity: *parity,
                    stop_bits: *stop_bits,
                };
                let frame = self
                    .rtu
                    .exchange(*serial_port, settings, request, expected, device.timeout())
                    .await?;
                let payload = modbus::parse_rtu_response(&frame, *slave_address, function)?;
                Ok(modbus::payload_to_words(function, quantity, &payload))
            }
            TransportConfig::Tcp { host, port, unit_id } => {
                let (tid, request) =
                    modbus::build_tcp_request(*unit_id, function, register.address, quantity);
                let frame = self
                    .tcp
                    .exchange(host, *port, device.timeout(), &request)
                    .await?;
                let payload = modbus::parse_tcp_response(&frame, tid, *unit_id, function)?;
                Ok(modbus::payload_to_words(function, quantity, &payload))
            }
        }
    }
}
