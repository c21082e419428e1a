// src/modbus/frame.rs
//
// Modbus frame build and parse for RTU and TCP (MBAP). Pure byte-level code,
// no I/O. The transport layer owns timing (inter-frame gaps, timeouts).
//
// RTU request: [slave | func | addr_hi | addr_lo | qty_hi | qty_lo | crc_lo | crc_hi]
// MBAP request: [tid_hi | tid_lo | 0x00 0x00 | len_hi | len_lo | unit | func | addr | qty]

use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::CodecError;

/// MBAP header length in bytes.
pub const MBAP_HEADER_LEN: usize = 7;

/// Process-wide MBAP transaction id counter. Monotonic, wraps at 16 bits.
static NEXT_TRANSACTION_ID: AtomicU16 = AtomicU16::new(0);

/// Allocate the next MBAP transaction id.
pub fn next_transaction_id() -> u16 {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// CRC-16/Modbus
// ============================================================================

/// CRC-16/Modbus: polynomial 0xA001 (reflected 0x8005), init 0xFFFF.
/// Transmitted low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

// ============================================================================
// Request Framing
// ============================================================================

/// Build an RTU read request with trailing CRC (low byte first).
pub fn build_rtu_request(slave: u8, function: u8, address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(function);
    frame.push((address >> 8) as u8);
    frame.push((address & 0xFF) as u8);
    frame.push((quantity >> 8) as u8);
    frame.push((quantity & 0xFF) as u8);
    let crc = crc16_modbus(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Build an MBAP read request. Returns the transaction id used so the caller
/// can match the response.
pub fn build_tcp_request(unit: u8, function: u8, address: u16, quantity: u16) -> (u16, Vec<u8>) {
    let tid = next_transaction_id();
    let mut frame = Vec::with_capacity(12);
    frame.push((tid >> 8) as u8);
    frame.push((tid & 0xFF) as u8);
    frame.push(0x00); // protocol id
    frame.push(0x00);
    frame.push(0x00); // length: unit + func + addr + qty = 6
    frame.push(0x06);
    frame.push(unit);
    frame.push(function);
    frame.push((address >> 8) as u8);
    frame.push((address & 0xFF) as u8);
    frame.push((quantity >> 8) as u8);
    frame.push((quantity & 0xFF) as u8);
    (tid, frame)
}

// ============================================================================
// Expected Response Lengths
// ============================================================================

/// Payload byte count of a normal read response for `function` and `quantity`.
/// Coil reads pack 8 points per byte; register reads use 2 bytes per register.
pub fn response_byte_count(function: u8, quantity: u16) -> usize {
    match function {
        0x01 | 0x02 => (quantity as usize + 7) / 8,
        _ => quantity as usize * 2,
    }
}

/// Total RTU response frame length: slave + func + byte_count + payload + crc.
pub fn expected_rtu_response_len(function: u8, quantity: u16) -> usize {
    3 + response_byte_count(function, quantity) + 2
}

/// Check whether an accumulating RTU buffer holds a complete frame.
/// Exception frames are always 5 bytes; normal frames run to the expected
/// length. Returns the frame length when complete.
pub fn rtu_frame_complete(buf: &[u8], expected_len: usize) -> Option<usize> {
    if buf.len() >= 2 && buf[1] & 0x80 != 0 {
        if buf.len() >= 5 {
            return Some(5);
        }
        return None;
    }
    if buf.len() >= expected_len {
        return Some(expected_len);
    }
    None
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Parse an RTU response frame. Validates CRC, slave echo and function code,
/// classifies exception frames, and returns the data payload (after the byte
/// count field).
pub fn parse_rtu_response(frame: &[u8], slave: u8, function: u8) -> Result<Vec<u8>, CodecError> {
    if frame.len() < 5 {
        return Err(CodecError::ShortFrame {
            needed: 5,
            got: frame.len(),
        });
    }

    let body_len = frame.len() - 2;
    let expected_crc = crc16_modbus(&frame[..body_len]);
    let actual_crc = (frame[body_len] as u16) | ((frame[body_len + 1] as u16) << 8);
    if expected_crc != actual_crc {
        return Err(CodecError::InvalidCrc {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    // Slave echo mismatch: the response is not ours
    if frame[0] != slave {
        return Err(CodecError::WrongFunction {
            expected: slave,
            actual: frame[0],
        });
    }

    parse_pdu(&frame[1..body_len], function)
}

/// Parse an MBAP response. `buf` is the full frame including the 7-byte
/// header. Validates transaction id echo, protocol id, declared length and
/// unit, then parses the PDU.
pub fn parse_tcp_response(
    buf: &[u8],
    tid: u16,
    unit: u8,
    function: u8,
) -> Result<Vec<u8>, CodecError> {
    if buf.len() < MBAP_HEADER_LEN + 2 {
        return Err(CodecError::ShortFrame {
            needed: MBAP_HEADER_LEN + 2,
            got: buf.len(),
        });
    }

    let rx_tid = ((buf[0] as u16) << 8) | buf[1] as u16;
    if rx_tid != tid {
        return Err(CodecError::InvalidMbap(format!(
            "transaction id mismatch: sent {}, got {}",
            tid, rx_tid
        )));
    }
    if buf[2] != 0 || buf[3] != 0 {
        return Err(CodecError::InvalidMbap(format!(
            "protocol id {:#06x}",
            ((buf[2] as u16) << 8) | buf[3] as u16
        )));
    }
    let declared_len = (((buf[4] as u16) << 8) | buf[5] as u16) as usize;
    if buf.len() != MBAP_HEADER_LEN - 1 + declared_len {
        return Err(CodecError::InvalidMbap(format!(
            "length field {} does not match frame of {} bytes",
            declared_len,
            buf.len()
        )));
    }
    if buf[6] != unit {
        return Err(CodecError::InvalidMbap(format!(
            "unit mismatch: sent {}, got {}",
            unit, buf[6]
        )));
    }

    parse_pdu(&buf[MBAP_HEADER_LEN..], function)
}

/// Parse a PDU: `[func | byte_count | data...]`, or an exception
/// `[func|0x80 | code]`. Returns the data bytes.
fn parse_pdu(pdu: &[u8], function: u8) -> Result<Vec<u8>, CodecError> {
    if pdu.len() < 2 {
        return Err(CodecError::ShortFrame {
            needed: 2,
            got: pdu.len(),
        });
    }

    let func = pdu[0];
    if func == function | 0x80 {
        return Err(CodecError::ModbusException(pdu[1]));
    }
    if func != function {
        return Err(CodecError::WrongFunction {
            expected: function,
            actual: func,
        });
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() < byte_count {
        return Err(CodecError::ShortFrame {
            needed: byte_count + 2,
            got: pdu.len(),
        });
    }
    Ok(data[..byte_count].to_vec())
}

// ============================================================================
// Payload Conversion
// ============================================================================

/// Convert a register read payload (big-endian byte pairs) into 16-bit words.
pub fn bytes_to_words(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
        .collect()
}

/// Unpack a coil/discrete read payload into one word per point (0 or 1).
/// 8 points per byte, LSB first within each byte (Modbus convention).
pub fn bits_to_words(payload: &[u8], quantity: u16) -> Vec<u16> {
    (0..quantity as usize)
        .map(|i| {
            let byte = payload.get(i / 8).copied().unwrap_or(0);
            ((byte >> (i % 8)) & 1) as u16
        })
        .collect()
}

/// Decode a read-response payload into words, bit-unpacked for coil function
/// codes and byte-paired for register function codes.
pub fn payload_to_words(function: u8, quantity: u16, payload: &[u8]) -> Vec<u16> {
    match function {
        0x01 | 0x02 => bits_to_words(payload, quantity),
        _ => bytes_to_words(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Canonical read-holding request: 01 03 00 00 00 01 -> CRC bytes 84 0A
        let frame = build_rtu_request(1, 3, 0x0000, 1);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_rtu_roundtrip() {
        // Response: slave 1, func 3, 2 bytes, value 0x0064
        let mut resp = vec![0x01, 0x03, 0x02, 0x00, 0x64];
        let crc = crc16_modbus(&resp);
        resp.push((crc & 0xFF) as u8);
        resp.push((crc >> 8) as u8);

        let payload = parse_rtu_response(&resp, 1, 3).unwrap();
        assert_eq!(payload, vec![0x00, 0x64]);
        assert_eq!(bytes_to_words(&payload), vec![0x0064]);
    }

    #[test]
    fn test_rtu_bad_crc_rejected() {
        let mut resp = vec![0x01, 0x03, 0x02, 0x00, 0x64];
        let crc = crc16_modbus(&resp);
        resp.push((crc & 0xFF) as u8);
        resp.push((crc >> 8) as u8 ^ 0xFF);

        match parse_rtu_response(&resp, 1, 3) {
            Err(CodecError::InvalidCrc { .. }) => {}
            other => panic!("expected InvalidCrc, got {:?}", other),
        }
    }

    #[test]
    fn test_rtu_exception_frame() {
        // func | 0x80, exception code 2 (illegal data address)
        let mut resp = vec![0x01, 0x83, 0x02];
        let crc = crc16_modbus(&resp);
        resp.push((crc & 0xFF) as u8);
        resp.push((crc >> 8) as u8);

        match parse_rtu_response(&resp, 1, 3) {
            Err(CodecError::ModbusException(2)) => {}
            other => panic!("expected ModbusException(2), got {:?}", other),
        }
        assert_eq!(rtu_frame_complete(&resp, expected_rtu_response_len(3, 1)), Some(5));
    }

    #[test]
    fn test_rtu_short_frame() {
        match parse_rtu_response(&[0x01, 0x03], 1, 3) {
            Err(CodecError::ShortFrame { .. }) => {}
            other => panic!("expected ShortFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_expected_lengths() {
        assert_eq!(expected_rtu_response_len(3, 1), 7); // 3 + 2 + 2
        assert_eq!(expected_rtu_response_len(3, 4), 13);
        assert_eq!(expected_rtu_response_len(1, 1), 6); // 1 coil -> 1 byte
        assert_eq!(expected_rtu_response_len(1, 16), 7); // 16 coils -> 2 bytes
    }

    #[test]
    fn test_frame_completion() {
        let expected = expected_rtu_response_len(3, 1);
        assert_eq!(rtu_frame_complete(&[0x01], expected), None);
        assert_eq!(rtu_frame_complete(&[0x01, 0x03, 0x02, 0x00], expected), None);
        assert_eq!(
            rtu_frame_complete(&[0x01, 0x03, 0x02, 0x00, 0x64, 0xB9, 0xAF], expected),
            Some(expected)
        );
    }

    #[test]
    fn test_mbap_roundtrip() {
        let (tid, request) = build_tcp_request(0x11, 3, 0x006B, 2);
        assert_eq!(request.len(), 12);
        assert_eq!(request[6], 0x11);
        assert_eq!(((request[4] as u16) << 8) | request[5] as u16, 6);

        // Response: header + func + byte count + 4 data bytes
        let mut resp = vec![
            (tid >> 8) as u8,
            (tid & 0xFF) as u8,
            0x00,
            0x00,
            0x00,
            0x07, // unit + func + count + 4 bytes
            0x11,
            0x03,
            0x04,
            0x02,
            0x2B,
            0x00,
            0x64,
        ];
        let payload = parse_tcp_response(&resp, tid, 0x11, 3).unwrap();
        assert_eq!(bytes_to_words(&payload), vec![0x022B, 0x0064]);

        // Mismatched transaction id is rejected
        resp[1] ^= 0xFF;
        match parse_tcp_response(&resp, tid, 0x11, 3) {
            Err(CodecError::InvalidMbap(_)) => {}
            other => panic!("expected InvalidMbap, got {:?}", other),
        }
    }

    #[test]
    fn test_tcp_exception() {
        let (tid, _) = build_tcp_request(1, 4, 0, 1);
        let resp = vec![
            (tid >> 8) as u8,
            (tid & 0xFF) as u8,
            0x00,
            0x00,
            0x00,
            0x03,
            0x01,
            0x84,
            0x0B,
        ];
        match parse_tcp_response(&resp, tid, 1, 4) {
            Err(CodecError::ModbusException(0x0B)) => {}
            other => panic!("expected ModbusException, got {:?}", other),
        }
    }

    #[test]
    fn test_transaction_id_wraps() {
        NEXT_TRANSACTION_ID.store(0xFFFF, Ordering::Relaxed);
        let first = next_transaction_id();
        let second = next_transaction_id();
        // Monotonic with 16-bit wrap; tolerant of allocations from
        // concurrently running tests
        let step = second.wrapping_sub(first);
        assert!(step >= 1 && step < 16, "tid stepped by {}", step);
    }

    #[test]
    fn test_coil_unpacking() {
        // 10 coils: byte 0 = 0b1100_1101, byte 1 = 0b0000_0001
        let words = bits_to_words(&[0xCD, 0x01], 10);
        assert_eq!(words, vec![1, 0, 1, 1, 0, 0, 1, 1, 1, 0]);
    }
}
