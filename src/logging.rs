//! # Callback Logging
//!
//! Pluggable traffic logging for the client. Host applications embedding the
//! crate (GUIs, provisioning tools) often want protocol traffic in their own
//! log pane rather than on stderr, so the logger forwards formatted lines to
//! a user callback instead of a fixed sink. Raw, interpreted, or combined
//! packet rendering is selected per logger.

use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FrameKind};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR: {}", timestamp, message),
                LogLevel::Warn => eprintln!("[{}] WARN: {}", timestamp, message),
                LogLevel::Info => println!("[{}] INFO: {}", timestamp, message),
                LogLevel::Debug => println!("[{}] DEBUG: {}", timestamp, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }

        let hex_data = data.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");

        let message = format!("{} packet ({} bytes): {}", direction, data.len(), hex_data);
        self.log(level, &message);
    }

    /// Log an outbound request frame
    pub fn log_request(&self, frame: &Frame, raw: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                self.log_packet(LogLevel::Info, "BMS Request ->", raw);
            }
            LoggingMode::Interpreted => {
                self.info(&self.interpret_frame("BMS Request ->", frame));
            }
            LoggingMode::Both => {
                self.info(&self.interpret_frame("BMS Request ->", frame));
                self.log_packet(LogLevel::Debug, "BMS Request ->", raw);
            }
        }
    }

    /// Log an inbound response frame with round-trip time
    pub fn log_response(&self, frame: &Frame, elapsed: Duration) {
        let line = format!(
            "{} [{} ms]",
            self.interpret_frame("BMS Response <-", frame),
            elapsed.as_millis()
        );
        match self.mode {
            LoggingMode::Raw | LoggingMode::Interpreted => self.info(&line),
            LoggingMode::Both => {
                self.info(&line);
                if let FrameKind::ReadResponse { data } = &frame.kind {
                    self.log_packet(LogLevel::Debug, "BMS Response <- data", data);
                }
            }
        }
    }

    /// Render a frame as a single human-readable line
    fn interpret_frame(&self, prefix: &str, frame: &Frame) -> String {
        let function_name = get_function_name(frame.function);
        let detail = match &frame.kind {
            FrameKind::ReadRequest { start, quantity } => {
                format!("Start: 0x{:04X}, Quantity: {}", start, quantity)
            }
            FrameKind::ReadResponse { data } => {
                let registers: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                format!(
                    "Byte count: {}, Registers: {:?}",
                    data.len(),
                    &registers[..registers.len().min(8)]
                )
            }
            FrameKind::WriteRequest { start, quantity, data } => {
                format!("Start: 0x{:04X}, Quantity: {}, Bytes: {}", start, quantity, data.len())
            }
            FrameKind::WriteResponse { start, quantity } => {
                format!("Start: 0x{:04X}, Quantity: {}", start, quantity)
            }
            FrameKind::Error { code } => {
                format!("Exception code: 0x{:02X}", code)
            }
        };
        format!(
            "{} Target: 0x{:02X}, Function: {} (0x{:02X}), {}",
            prefix, frame.target, function_name, frame.function, detail
        )
    }
}

/// Get human-readable function name for a raw function byte
fn get_function_name(function: u8) -> &'static str {
    match function & 0x7F {
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x0F => "Cloud Socket Report",
        0x10 => "Write Multiple Registers",
        0x11 => "Assign Slave Address",
        0x7F => "Read Device UUID",
        _ => "Unknown Function",
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}
