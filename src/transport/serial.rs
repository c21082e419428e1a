// src/transport/serial.rs
//
// RTU serial transport. One mutex per serial port serializes every exchange
// on that port; RTU devices sharing a port form an exclusion group.
//
// Exchange sequence: flush RX, transmit, then read until the expected frame
// length has arrived (exception frames complete at 5 bytes) or the device
// timeout expires. Between successive requests on the same port the standard
// 3.5-character idle gap is enforced, derived from the baud rate.

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};

use crate::config::types::Parity;
use crate::error::TransportError;
use crate::modbus::frame::crc16_modbus;
use crate::modbus::rtu_frame_complete;

/// How long a caller waits on a busy port mutex before giving up.
const PORT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Granularity of the blocking read loop.
const READ_SLICE_TIMEOUT: Duration = Duration::from_millis(10);

/// Serial framing parameters for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

/// Minimum idle time between frames on one port: 3.5 character times at the
/// configured baud (11 bits per character), floored at 1.75 ms above 19200
/// baud per the Modbus serial line spec.
pub fn inter_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19_200 {
        Duration::from_micros(1750)
    } else {
        let char_time_us = 11_000_000u64 / baud_rate.max(1) as u64;
        Duration::from_micros(char_time_us * 7 / 2)
    }
}

struct PortState {
    port: Option<Box<dyn SerialPort>>,
    open_settings: Option<SerialSettings>,
    last_exchange: Option<Instant>,
}

/// One serialized serial port.
struct PortSlot {
    state: Mutex<PortState>,
}

/// All RTU ports, keyed by the platform port ordinal.
pub struct RtuBus {
    /// Platform device paths by ordinal, e.g. `/dev/ttyUSB0`
    port_paths: Vec<String>,
    slots: Mutex<HashMap<u8, Arc<PortSlot>>>,
}

impl RtuBus {
    pub fn new(port_paths: Vec<String>) -> Self {
        Self {
            port_paths,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, port_no: u8) -> Arc<PortSlot> {
        let mut slots = self.slots.lock().expect("port table poisoned");
        slots
            .entry(port_no)
            .or_insert_with(|| {
                Arc::new(PortSlot {
                    state: Mutex::new(PortState {
                        port: None,
                        open_settings: None,
                        last_exchange: None,
                    }),
                })
            })
            .clone()
    }

    /// Send `request` on `port_no` and collect the RTU response frame.
    /// Runs the blocking serial I/O on the blocking thread pool.
    pub async fn exchange(
        &self,
        port_no: u8,
        settings: SerialSettings,
        request: Vec<u8>,
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let slot = self.slot(port_no);
        let path = self
            .port_paths
            .get(port_no as usize)
            .cloned()
            .ok_or(TransportError::Serial {
                port: port_no,
                detail: "no such serial port".to_string(),
            })?;

        tokio::task::spawn_blocking(move || {
            exchange_blocking(&slot, port_no, &path, settings, &request, expected_len, timeout)
        })
        .await
        .map_err(|e| TransportError::Serial {
            port: port_no,
            detail: format!("serial task failed: {}", e),
        })?
    }
}

fn exchange_blocking(
    slot: &PortSlot,
    port_no: u8,
    path: &str,
    settings: SerialSettings,
    request: &[u8],
    expected_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    // Acquire the port, bounded: a wedged exchange elsewhere surfaces as
    // PortBusy instead of blocking this device forever.
    let acquire_deadline = Instant::now() + PORT_ACQUIRE_TIMEOUT;
    let mut state = loop {
        match slot.state.try_lock() {
            Ok(guard) => break guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                if Instant::now() >= acquire_deadline {
                    return Err(TransportError::PortBusy(port_no));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(std::sync::TryLockError::Poisoned(_)) => {
                return Err(TransportError::Serial {
                    port: port_no,
                    detail: "port mutex poisoned".to_string(),
                });
            }
        }
    };

    ensure_open(&mut state, port_no, path, settings)?;

    // 3.5-character idle between frames on this port
    if let Some(last) = state.last_exchange {
        let gap = inter_frame_gap(settings.baud_rate);
        let since = last.elapsed();
        if since < gap {
            std::thread::sleep(gap - since);
        }
    }

    let port = state.port.as_mut().expect("port opened above");

    port.clear(ClearBuffer::Input).map_err(|e| TransportError::Serial {
        port: port_no,
        detail: format!("flush failed: {}", e),
    })?;

    port.write_all(request)
        .and_then(|_| port.flush())
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

    // Accumulate the reply, stopping at a complete frame or the deadline
    let deadline = Instant::now() + timeout;
    let mut response: Vec<u8> = Vec::with_capacity(expected_len);
    let mut chunk = [0u8; 64];

    loop {
        // Stop as soon as a complete frame with a valid CRC has arrived.
        // On a CRC mismatch keep listening: the line may still be settling.
        if let Some(len) = rtu_frame_complete(&response, expected_len) {
            if frame_crc_valid(&response[..len]) {
                response.truncate(len);
                break;
            }
        }
        if Instant::now() >= deadline {
            if response.is_empty() {
                state.last_exchange = Some(Instant::now());
                return Err(TransportError::ReadTimeout(timeout.as_millis() as u64));
            }
            // Partial frame: hand it to the parser for classification
            break;
        }

        let _ = port.set_timeout(READ_SLICE_TIMEOUT);
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                state.last_exchange = Some(Instant::now());
                return Err(TransportError::Serial {
                    port: port_no,
                    detail: format!("read failed: {}", e),
                });
            }
        }
    }

    state.last_exchange = Some(Instant::now());
    Ok(response)
}

/// Whether a frame's trailing CRC (low byte first) matches its body.
fn frame_crc_valid(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let body = &frame[..frame.len() - 2];
    let wire = (frame[frame.len() - 2] as u16) | ((frame[frame.len() - 1] as u16) << 8);
    crc16_modbus(body) == wire
}

/// Open the port, or reopen it when the device framing differs from the
/// current open settings.
fn ensure_open(
    state: &mut PortState,
    port_no: u8,
    path: &str,
    settings: SerialSettings,
) -> Result<(), TransportError> {
    if state.port.is_some() && state.open_settings == Some(settings) {
        return Ok(());
    }

    if state.port.take().is_some() {
        tdbg!("serial", "[RTU:{}] Reopening {} for new framing", port_no, path);
    }

    let port = serialport::new(path, settings.baud_rate)
        .data_bits(to_serialport_data_bits(settings.data_bits))
        .parity(to_serialport_parity(settings.parity))
        .stop_bits(to_serialport_stop_bits(settings.stop_bits))
        .timeout(READ_SLICE_TIMEOUT)
        .open()
        .map_err(|e| TransportError::Serial {
            port: port_no,
            detail: format!("failed to open {}: {}", path, e),
        })?;

    tlog!(
        "[RTU:{}] Opened {} ({} baud, {}{}{})",
        port_no,
        path,
        settings.baud_rate,
        settings.data_bits,
        match settings.parity {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        },
        settings.stop_bits
    );

    state.port = Some(port);
    state.open_settings = Some(settings);
    state.last_exchange = None;
    Ok(())
}

fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_serialport_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}
