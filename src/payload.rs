//! # Socket Payload Envelope
//!
//! Frames crossing the message bus are wrapped in a small JSON envelope
//! carrying the frame bytes as an uppercase hex string:
//!
//! ```text
//! {"hex":"7F5501400300000002C40BFD"}
//! ```
//!
//! Some producers publish the bare hex string without the envelope, so
//! decoding falls back to treating the whole payload as hex. Whitespace
//! inside the hex string is tolerated.

use serde::{Deserialize, Serialize};

use crate::error::{BmsError, BmsResult};

#[derive(Debug, Serialize, Deserialize)]
struct SocketEnvelope {
    hex: String,
}

/// Wrap frame bytes in the JSON hex envelope
pub fn encode_socket_payload(frame: &[u8]) -> Vec<u8> {
    let envelope = SocketEnvelope {
        hex: hex::encode_upper(frame),
    };
    // Serializing a struct with one string field cannot fail
    serde_json::to_vec(&envelope).unwrap_or_default()
}

/// Unwrap an inbound bus payload into frame bytes
///
/// Accepts the JSON envelope or a bare hex string payload.
pub fn decode_socket_payload(payload: &[u8]) -> BmsResult<Vec<u8>> {
    let hex_str = match serde_json::from_slice::<SocketEnvelope>(payload) {
        Ok(envelope) => envelope.hex,
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    };
    hex_to_bytes(&hex_str)
}

/// Decode a hex string, tolerating interior whitespace
pub fn hex_to_bytes(text: &str) -> BmsResult<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(BmsError::invalid_data(
            format!("hex string length must be even, got {}", compact.len())
        ));
    }
    hex::decode(&compact)
        .map_err(|e| BmsError::invalid_data(format!("bad hex payload: {}", e)))
}
