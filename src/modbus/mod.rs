// src/modbus/mod.rs
//
// Modbus codec: request/response framing for RTU and TCP, and the register
// value decoder. Pure functions only; timing and sockets live in transport.

pub mod decode;
pub mod frame;

pub use decode::{apply_scaling, DataType};
pub use frame::{
    build_rtu_request, build_tcp_request, expected_rtu_response_len, parse_rtu_response,
    parse_tcp_response, payload_to_words, response_byte_count, rtu_frame_complete,
    MBAP_HEADER_LEN,
};

/// Standard Modbus exception code names, for logs and status reports.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
