//! # Voltage BMS Error Handling
//!
//! This module provides comprehensive error handling for the Voltage BMS library,
//! covering transport failures, frame parsing, CRC validation, request
//! correlation, and device-reported exceptions.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket, BLE, and broker communication failures
//! - **Connection Errors**: connection establishment problems
//! - **ConnectionLost**: the inbound stream ended while the session was in use
//! - **Timeout Errors**: request deadlines with operation context
//!
//! ### Protocol Errors
//! - **Frame Errors**: malformed frame boundary markers or lengths — always
//!   recoverable by resynchronizing the collector, never fatal to a session
//! - **CRC Errors**: structurally valid frame failing its integrity check
//! - **Exception Responses**: error frames returned by the device
//!
//! ### Session Errors
//! - **Busy**: a request was issued while another was outstanding
//! - **Cancelled**: the session was closed while a request was pending
//!
//! ## Error Recovery
//!
//! Many errors provide information about recoverability:
//!
//! ```rust
//! use voltage_bms::{BmsError, BmsResult};
//!
//! fn handle_error(result: BmsResult<Vec<u16>>) {
//!     match result {
//!         Ok(data) => println!("Success: {:?}", data),
//!         Err(error) => {
//!             if error.is_recoverable() {
//!                 println!("Retryable error: {}", error);
//!             } else {
//!                 println!("Fatal error: {}", error);
//!             }
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for BMS operations
///
/// This is a convenience type alias that uses `BmsError` as the error type
/// for all BMS operations, providing consistent error handling throughout
/// the codebase.
pub type BmsResult<T> = Result<T, BmsError>;

/// Comprehensive BMS error types
///
/// This enumeration covers all failure conditions in BMS communication, from
/// transport-level issues to protocol violations and session-state errors.
/// Nothing here is fatal to the hosting process: all failures are scoped to
/// one session or one request.
#[derive(Error, Debug, Clone)]
pub enum BmsError {
    /// I/O related errors (socket, BLE stack, broker)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment errors
    ///
    /// # Examples
    /// - Broker refused the connection
    /// - BLE peripheral not found during scan
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The transport's inbound stream ended
    ///
    /// Fails any pending request and makes the session unusable until
    /// reconnected. Reconnection is the caller's responsibility.
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Timeout errors
    ///
    /// Occurs when a request receives no matching response within its
    /// configured deadline. The session remains usable for the next request.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A request was issued while another request was outstanding
    ///
    /// Surfaced immediately with no state change; the session-level policy is
    /// fail-fast rather than queueing.
    #[error("Session busy: a request is already outstanding")]
    Busy,

    /// The session was closed while a request was pending
    #[error("Request cancelled: session closed")]
    Cancelled,

    /// Frame parsing errors
    ///
    /// Malformed boundary markers, impossible lengths, or truncated frames.
    /// Recoverable: the collector resynchronizes and scans onward.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure
    ///
    /// The frame was structurally well-formed but its integrity check failed.
    /// Provides both expected and actual CRC values for debugging; may be
    /// logged as a signal-quality indicator.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Device error frame
    ///
    /// The device answered with an error frame (function code with bit 0x80
    /// set) carrying a one-byte error code.
    #[error("Device exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Invalid function code
    #[error("Invalid function code: {code:#04X}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// # Examples
    /// - Zero quantity in a read request
    /// - Quantity exceeding the 250-byte payload ceiling
    #[error("Invalid address: start={start:#06X}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BmsError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new connection-lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a device exception error
    ///
    /// Automatically maps known error codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Register Address",
            0x03 => "Illegal Data Value",
            0x04 => "Device Failure",
            0x06 => "Device Busy",
            _ => "Unknown Exception",
        }.to_string();

        Self::Exception { function, code, message }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// Determines whether an operation that failed with this error might
    /// succeed if retried on the same session.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_bms::BmsError;
    ///
    /// let timeout_error = BmsError::timeout("read_registers", 8000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let invalid_function = BmsError::invalid_function(0x99);
    /// assert!(!invalid_function.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Busy => true,
            Self::Frame { .. } => true,
            Self::CrcMismatch { .. } => true,
            Self::Exception { code, .. } => {
                // Device busy clears on its own
                *code == 0x06
            },
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Io { .. } |
            Self::Connection { .. } |
            Self::ConnectionLost { .. } |
            Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::Frame { .. } |
            Self::CrcMismatch { .. } |
            Self::Exception { .. } |
            Self::InvalidFunction { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for BmsError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The specific timeout duration should be provided when creating timeout
/// errors manually; this conversion is a generic fallback.
impl From<tokio::time::error::Elapsed> for BmsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for BmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}
