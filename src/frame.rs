//! # BMS Frame Codec
//!
//! This module contains the core BMS wire protocol definitions: frame
//! boundary constants, function codes, the `Frame` structure, and the
//! encode/decode logic including CRC validation.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────┬──────┬────────┬────────┬──────────┬──────────┬──────┬──────┬──────┐
//! │ 0x7F │ 0x55 │ target │ source │ function │   body   │ CRCL │ CRCH │ 0xFD │
//! └──────┴──────┴────────┴────────┴──────────┴──────────┴──────┴──────┴──────┘
//! ```
//!
//! Body layout depends on the frame kind:
//! - read request / write response: `startHi startLo qtyHi qtyLo` (total 12)
//! - read response: `byteCount data...` (total `9 + byteCount`)
//! - write request: `startHi startLo qtyHi qtyLo byteCount data...`
//!   (total `13 + byteCount`)
//! - error: `code` with bit 0x80 set on the function byte (total 9)
//!
//! The CRC is CRC-16/MODBUS appended low byte first. Its start offset is a
//! per-transport configuration option ([`CrcMode`]) because reference frame
//! producers disagree on whether the target-address byte is covered.

use serde::{Deserialize, Serialize};
use std::fmt;
use crc::{Crc, CRC_16_MODBUS};
use crate::error::{BmsError, BmsResult};

/// Frame header marker bytes
pub const FRAME_HEADER: [u8; 2] = [0x7F, 0x55];

/// Frame trailer marker byte
pub const FRAME_TAIL: u8 = 0xFD;

/// Shortest possible frame (error frame / empty read response)
pub const MIN_FRAME_LEN: usize = 9;

/// Maximum payload bytes in a single frame
pub const MAX_PAYLOAD_BYTES: usize = 250;

/// CRC calculator for BMS frames
const CRC_BMS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC coverage region
///
/// The checksum always ends just before the CRC bytes; where it starts is an
/// interoperability hazard in the field, so it is selected once per transport
/// profile rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrcMode {
    /// CRC covers everything after the 2-byte header (from the target byte)
    AfterHeader,
    /// CRC covers everything after the target-address byte (from the source byte)
    AfterTarget,
}

impl CrcMode {
    /// Byte offset where the CRC region begins
    pub fn region_start(self) -> usize {
        match self {
            CrcMode::AfterHeader => 2,
            CrcMode::AfterTarget => 3,
        }
    }

    /// The opposite mode, used for decode fallback
    pub fn other(self) -> Self {
        match self {
            CrcMode::AfterHeader => CrcMode::AfterTarget,
            CrcMode::AfterTarget => CrcMode::AfterHeader,
        }
    }
}

impl Default for CrcMode {
    fn default() -> Self {
        CrcMode::AfterHeader
    }
}

/// Compute the frame CRC over `body` (header included, CRC/tail excluded)
/// for the given mode.
pub fn frame_crc(body: &[u8], mode: CrcMode) -> u16 {
    let start = mode.region_start().min(body.len());
    CRC_BMS.checksum(&body[start..])
}

/// BMS function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BmsFunction {
    /// Read Holding Registers (0x03)
    ReadHolding = 0x03,
    /// Read Input Registers (0x04)
    ReadInput = 0x04,
    /// Cloud Socket spontaneous report (0x0F)
    CloudSocket = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultiple = 0x10,
    /// Assign Slave Address (0x11)
    AssignAddress = 0x11,
    /// Read Device UUID (0xFF)
    ReadUuid = 0xFF,
}

impl BmsFunction {
    /// Convert from u8 to BmsFunction
    pub fn from_u8(value: u8) -> BmsResult<Self> {
        match value {
            0x03 => Ok(BmsFunction::ReadHolding),
            0x04 => Ok(BmsFunction::ReadInput),
            0x0F => Ok(BmsFunction::CloudSocket),
            0x10 => Ok(BmsFunction::WriteMultiple),
            0x11 => Ok(BmsFunction::AssignAddress),
            0xFF => Ok(BmsFunction::ReadUuid),
            _ => Err(BmsError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read-class function (byte-count framed responses)
    pub fn is_read_function(self) -> bool {
        matches!(self,
            BmsFunction::ReadHolding |
            BmsFunction::ReadInput |
            BmsFunction::CloudSocket |
            BmsFunction::ReadUuid
        )
    }

    /// Check if this is a write-class function (fixed-length responses)
    pub fn is_write_function(self) -> bool {
        matches!(self, BmsFunction::WriteMultiple | BmsFunction::AssignAddress)
    }
}

impl fmt::Display for BmsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BmsFunction::ReadHolding => "Read Holding Registers",
            BmsFunction::ReadInput => "Read Input Registers",
            BmsFunction::CloudSocket => "Cloud Socket Report",
            BmsFunction::WriteMultiple => "Write Multiple Registers",
            BmsFunction::AssignAddress => "Assign Slave Address",
            BmsFunction::ReadUuid => "Read Device UUID",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Frame body, discriminated by wire length and function class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Host asks for `quantity` registers starting at `start`
    ReadRequest { start: u16, quantity: u16 },
    /// Device answers a read with raw register bytes
    ReadResponse { data: Vec<u8> },
    /// Host writes register values (big-endian bytes)
    WriteRequest { start: u16, quantity: u16, data: Vec<u8> },
    /// Device echoes a write's address and quantity
    WriteResponse { start: u16, quantity: u16 },
    /// Device error report (function byte carries bit 0x80)
    Error { code: u8 },
}

/// One complete protocol frame
///
/// Immutable once constructed; created by the encode constructors below, or
/// by [`Frame::decode`] / the collector on successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Recipient address byte (wire offset 2)
    pub target: u8,
    /// Sender address byte (wire offset 3)
    pub source: u8,
    /// Raw function byte (bit 0x80 set for error frames)
    pub function: u8,
    pub kind: FrameKind,
}

impl Frame {
    /// Build a read request frame
    pub fn read_request(target: u8, source: u8, function: BmsFunction, start: u16, quantity: u16) -> Self {
        Self {
            target,
            source,
            function: function.to_u8(),
            kind: FrameKind::ReadRequest { start, quantity },
        }
    }

    /// Build a read response frame
    pub fn read_response(target: u8, source: u8, function: BmsFunction, data: Vec<u8>) -> Self {
        Self {
            target,
            source,
            function: function.to_u8(),
            kind: FrameKind::ReadResponse { data },
        }
    }

    /// Build a write request frame from register values
    pub fn write_request(target: u8, source: u8, function: BmsFunction, start: u16, registers: &[u16]) -> Self {
        Self {
            target,
            source,
            function: function.to_u8(),
            kind: FrameKind::WriteRequest {
                start,
                quantity: registers.len() as u16,
                data: data_utils::registers_to_bytes(registers),
            },
        }
    }

    /// Build a write response frame
    pub fn write_response(target: u8, source: u8, function: BmsFunction, start: u16, quantity: u16) -> Self {
        Self {
            target,
            source,
            function: function.to_u8(),
            kind: FrameKind::WriteResponse { start, quantity },
        }
    }

    /// Build an error frame for a request's raw function byte
    pub fn error(target: u8, source: u8, request_function: u8, code: u8) -> Self {
        Self {
            target,
            source,
            function: request_function | 0x80,
            kind: FrameKind::Error { code },
        }
    }

    /// Check if this is a device error frame
    pub fn is_error(&self) -> bool {
        matches!(self.kind, FrameKind::Error { .. })
    }

    /// Payload byte count, if this frame kind carries one
    pub fn byte_count(&self) -> Option<u8> {
        match &self.kind {
            FrameKind::ReadResponse { data } => Some(data.len() as u8),
            FrameKind::WriteRequest { data, .. } => Some(data.len() as u8),
            _ => None,
        }
    }

    /// Encode the frame to wire bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if a payload exceeds [`MAX_PAYLOAD_BYTES`].
    pub fn encode(&self, crc_mode: CrcMode) -> BmsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + 8);
        out.extend_from_slice(&FRAME_HEADER);
        out.push(self.target);
        out.push(self.source);
        out.push(self.function);

        match &self.kind {
            FrameKind::ReadRequest { start, quantity } => {
                out.extend_from_slice(&start.to_be_bytes());
                out.extend_from_slice(&quantity.to_be_bytes());
            }
            FrameKind::ReadResponse { data } => {
                if data.len() > MAX_PAYLOAD_BYTES {
                    return Err(BmsError::invalid_data(
                        format!("read response payload too large: {} bytes", data.len())
                    ));
                }
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            FrameKind::WriteRequest { start, quantity, data } => {
                if data.len() > MAX_PAYLOAD_BYTES {
                    return Err(BmsError::invalid_data(
                        format!("write request payload too large: {} bytes", data.len())
                    ));
                }
                out.extend_from_slice(&start.to_be_bytes());
                out.extend_from_slice(&quantity.to_be_bytes());
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            FrameKind::WriteResponse { start, quantity } => {
                out.extend_from_slice(&start.to_be_bytes());
                out.extend_from_slice(&quantity.to_be_bytes());
            }
            FrameKind::Error { code } => {
                out.push(*code);
            }
        }

        let crc = frame_crc(&out, crc_mode);
        out.push((crc & 0xFF) as u8); // CRCL
        out.push((crc >> 8) as u8); // CRCH
        out.push(FRAME_TAIL);
        Ok(out)
    }

    /// Decode one complete frame from wire bytes
    ///
    /// Verifies header and trailer markers, recomputes the CRC over the
    /// configured region and compares. When `allow_crc_fallback` is set a
    /// mismatch is retried with the opposite [`CrcMode`] before failing —
    /// counterpart systems in the field disagree on the region start.
    pub fn decode(bytes: &[u8], crc_mode: CrcMode, allow_crc_fallback: bool) -> BmsResult<Frame> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(BmsError::frame(format!("frame too short: {} bytes", bytes.len())));
        }
        if bytes[0] != FRAME_HEADER[0] || bytes[1] != FRAME_HEADER[1] {
            return Err(BmsError::frame("bad frame header"));
        }
        if bytes[bytes.len() - 1] != FRAME_TAIL {
            return Err(BmsError::frame("bad frame tail"));
        }

        let body = &bytes[..bytes.len() - 3];
        let declared = u16::from_le_bytes([bytes[bytes.len() - 3], bytes[bytes.len() - 2]]);

        if frame_crc(body, crc_mode) != declared {
            let fallback_ok = allow_crc_fallback
                && frame_crc(body, crc_mode.other()) == declared;
            if !fallback_ok {
                return Err(BmsError::crc_mismatch(frame_crc(body, crc_mode), declared));
            }
        }

        let target = bytes[2];
        let source = bytes[3];
        let function = bytes[4];
        let len = bytes.len();

        // Error frame: function = request + 0x80, fixed length 9. 0xFF is
        // the UUID read function, not an error code, and stays on the
        // read-response path below.
        if len == 9 && (function & 0x80) != 0 && function != BmsFunction::ReadUuid.to_u8() {
            return Ok(Frame {
                target,
                source,
                function,
                kind: FrameKind::Error { code: bytes[5] },
            });
        }

        // 12-byte frames are read requests or write responses, disambiguated
        // by function class
        if len == 12 {
            let start = u16::from_be_bytes([bytes[5], bytes[6]]);
            let quantity = u16::from_be_bytes([bytes[7], bytes[8]]);
            let func = BmsFunction::from_u8(function)?;
            let kind = if func.is_write_function() {
                FrameKind::WriteResponse { start, quantity }
            } else {
                FrameKind::ReadRequest { start, quantity }
            };
            return Ok(Frame { target, source, function, kind });
        }

        // Write request: byte-count at offset 9. Restricted to write-class
        // functions, since a read response's data bytes can alias this shape.
        if len >= 13 {
            let byte_count = bytes[9] as usize;
            if 13 + byte_count == len && BmsFunction::from_u8(function)?.is_write_function() {
                let start = u16::from_be_bytes([bytes[5], bytes[6]]);
                let quantity = u16::from_be_bytes([bytes[7], bytes[8]]);
                return Ok(Frame {
                    target,
                    source,
                    function,
                    kind: FrameKind::WriteRequest {
                        start,
                        quantity,
                        data: bytes[10..10 + byte_count].to_vec(),
                    },
                });
            }
        }

        // Read response: byte-count at offset 5
        let byte_count = bytes[5] as usize;
        if MIN_FRAME_LEN + byte_count == len {
            BmsFunction::from_u8(function)?;
            return Ok(Frame {
                target,
                source,
                function,
                kind: FrameKind::ReadResponse {
                    data: bytes[6..6 + byte_count].to_vec(),
                },
            });
        }

        Err(BmsError::frame(format!(
            "unrecognized frame shape (function=0x{:02X}, len={})", function, len
        )))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> BmsResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(BmsError::invalid_data(
                format!("register data length must be even, got {}", bytes.len())
            ));
        }

        let mut registers = Vec::with_capacity(bytes.len() / 2);
        for chunk in bytes.chunks(2) {
            registers.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        Ok(registers)
    }

    /// Convert u32 to two u16 registers (high register first)
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two u16 registers to u32 (high register first)
    pub fn registers_to_u32(registers: &[u16]) -> BmsResult<u32> {
        if registers.len() < 2 {
            return Err(BmsError::invalid_data("need at least 2 registers for u32".to_string()));
        }
        Ok(((registers[0] as u32) << 16) | (registers[1] as u32))
    }
}
