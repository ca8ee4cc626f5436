//! # Parameter Decoder
//!
//! Maps raw register ranges to typed, named values using a static field
//! registry. A field is included in the decoded result only when its entire
//! register span lies inside the fetched range; partially-overlapping fields
//! are silently omitted so callers never see a truncated multi-register
//! integer or string.

use std::collections::BTreeMap;
use serde::Serialize;

use crate::error::{BmsError, BmsResult};
use crate::frame::data_utils;
use crate::layout::{RegisterLayout, RegisterSpan};

/// Value type of a registry field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Low byte of a single register
    U8,
    /// One register
    U16,
    /// Two consecutive registers, high register first
    U32,
    /// Fixed-length text, one register span's bytes trimmed of trailing fill
    Str(u16),
}

impl ParamType {
    /// Register span length of this type
    pub fn register_count(self) -> u16 {
        match self {
            ParamType::U8 | ParamType::U16 => 1,
            ParamType::U32 => 2,
            ParamType::Str(registers) => registers,
        }
    }
}

/// Decoded field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Str(String),
}

/// Static, read-only registry entry
///
/// Used only for lookup; never mutated at runtime. Keys are the canonical
/// snake_case identifiers and appear unchanged in decoded output.
#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub key: &'static str,
    pub address: u16,
    pub ty: ParamType,
}

impl ParamDef {
    /// The register span this field occupies
    pub fn span(&self) -> RegisterSpan {
        RegisterSpan {
            start: self.address,
            end: self.address + self.ty.register_count(),
        }
    }
}

/// Fixed-region field registry
///
/// Process-wide, initialized at compile time, passed by reference into
/// [`decode`].
pub const FIXED_REGION_PARAMS: &[ParamDef] = &[
    ParamDef { key: "device_address", address: 0x0001, ty: ParamType::U8 },
    ParamDef { key: "firmware_version", address: 0x0002, ty: ParamType::U16 },
    ParamDef { key: "pack_voltage", address: 0x0100, ty: ParamType::U16 },
    ParamDef { key: "pack_current", address: 0x0101, ty: ParamType::U32 },
    ParamDef { key: "state_of_charge", address: 0x0103, ty: ParamType::U8 },
    ParamDef { key: "cycle_count", address: 0x0104, ty: ParamType::U16 },
    ParamDef { key: "cell_count", address: 0x013F, ty: ParamType::U16 },
    ParamDef { key: "temp_sensor_count", address: 0x0140, ty: ParamType::U16 },
];

/// Build the identity field definitions for a resolved layout
///
/// The four identity fields are contiguous, so one 53-register read covers
/// them all; these definitions split that read back into named values.
pub fn identity_defs(layout: &RegisterLayout) -> Vec<ParamDef> {
    vec![
        ParamDef {
            key: "hw_model",
            address: layout.hw_model.start,
            ty: ParamType::Str(layout.hw_model.count()),
        },
        ParamDef {
            key: "battery_group_id",
            address: layout.battery_group_id.start,
            ty: ParamType::Str(layout.battery_group_id.count()),
        },
        ParamDef {
            key: "board_code",
            address: layout.board_code.start,
            ty: ParamType::Str(layout.board_code.count()),
        },
        ParamDef {
            key: "bluetooth_mac",
            address: layout.bluetooth_mac.start,
            ty: ParamType::Str(layout.bluetooth_mac.count()),
        },
    ]
}

/// Decode a fetched register range into named values
///
/// `registers` holds `quantity` values fetched starting at `address`. Every
/// definition whose span is fully contained in the range contributes one
/// entry to the result map.
pub fn decode(
    defs: &[ParamDef],
    address: u16,
    quantity: u16,
    registers: &[u16],
) -> BmsResult<BTreeMap<String, ParamValue>> {
    if registers.len() < quantity as usize {
        return Err(BmsError::invalid_data(format!(
            "register range too short: expected {}, got {}", quantity, registers.len()
        )));
    }

    let mut values = BTreeMap::new();
    for def in defs {
        let span = def.span();
        if !span.contained_in(address, quantity) {
            continue;
        }
        let offset = (span.start - address) as usize;
        let slice = &registers[offset..offset + span.count() as usize];

        let value = match def.ty {
            ParamType::U8 => ParamValue::U8((slice[0] & 0xFF) as u8),
            ParamType::U16 => ParamValue::U16(slice[0]),
            ParamType::U32 => ParamValue::U32(data_utils::registers_to_u32(slice)?),
            ParamType::Str(_) => ParamValue::Str(decode_text(slice)),
        };
        values.insert(def.key.to_string(), value);
    }

    Ok(values)
}

/// Extract a text field from register bytes, trimming trailing fill
fn decode_text(registers: &[u16]) -> String {
    let mut bytes = data_utils::registers_to_bytes(registers);
    while matches!(bytes.last(), Some(0x00) | Some(0xFF) | Some(b' ')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
