//! # Voltage BMS - Battery Management System Protocol Stack
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! An async implementation of the 0x7F55 battery-pack wire protocol in pure
//! Rust, covering framing, stream reassembly, register-map resolution, and
//! the MQTT, BLE and WebSocket links packs are reached over in production.
//!
//! ## Features
//!
//! - **🚀 Async Throughout**: Tokio-based client, simulator and bridge
//! - **🔌 Transport Agnostic**: One engine over MQTT, BLE, WebSocket or
//!   in-process channels
//! - **🛡️ Robust Framing**: CRC-validated frames resynchronized from
//!   arbitrary stream boundaries
//! - **🔋 Register-Map Aware**: Runtime layout resolution from pack-reported
//!   cell and sensor counts
//! - **📊 Built-in Monitoring**: Per-layer statistics and callback logging
//! - **🏭 Production Ready**: Device simulator for end-to-end testing
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Simulator |
//! |------|----------|--------|-----------|
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x0F | Cloud Socket Report | ✅ (receive) | ✅ (emit) |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x11 | Assign Slave Address | ✅ | ✅ |
//! | 0xFF | Read Device UUID | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use voltage_bms::{BmsClient, BmsClientConfig, BmsResult};
//! use voltage_bms::transport::{MqttTransport, MqttTransportConfig, MqttRole};
//!
//! #[tokio::main]
//! async fn main() -> BmsResult<()> {
//!     let transport = MqttTransport::connect(MqttTransportConfig {
//!         host: "broker.example.com".to_string(),
//!         device_id: "BMS-0042".to_string(),
//!         role: MqttRole::Host,
//!         ..Default::default()
//!     }).await?;
//!
//!     let mut client = BmsClient::new(transport, BmsClientConfig::default());
//!
//!     let (cells, sensors) = client.read_counts().await?;
//!     println!("{} cells, {} temperature sensors", cells, sensors);
//!
//!     let identity = client.read_identity().await?;
//!     println!("identity: {:?}", identity);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Simulator Example
//!
//! ```rust,no_run
//! use voltage_bms::{BmsClient, BmsClientConfig};
//! use voltage_bms::simulator::{DeviceSimulator, SimulatorConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let simulator = DeviceSimulator::new(SimulatorConfig {
//!         cell_count: 16,
//!         report_interval: Some(Duration::from_secs(5)),
//!         ..Default::default()
//!     });
//!     let transport = simulator.spawn();
//!
//!     let mut client = BmsClient::new(transport, BmsClientConfig::default());
//!     let values = client.read_range(0x0100, 5).await?;
//!     println!("pack telemetry: {:?}", values);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Application   │    │     Bridge      │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   BMS Client    │    │  Byte Relay     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Frame Collector │    │   WebSocket /   │
//! │  + Frame Codec  │    │   MQTT Legs     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Transport     │◄──►│  Device / Sim   │
//! │ (MQTT/BLE/Chan) │    │ (Register Bank) │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Wire protocol definitions: frame codec, function codes, CRC
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod frame;

/// Stream-to-frame reassembly with resynchronization
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod collector;

/// Variable register-map resolution from pack-reported counts
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod layout;

/// Named parameter registry and register-range decoding
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod params;

/// JSON hex envelope used on the message bus
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod payload;

/// Transport layer for MQTT and BLE links
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod transport;

/// BMS client implementation
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod client;

/// In-process battery pack simulator
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod simulator;

/// WebSocket-to-MQTT bridge server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod bridge;

/// Connection credential checks
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod auth;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use error::{BmsError, BmsResult};
pub use frame::{BmsFunction, CrcMode, Frame, FrameKind, FRAME_HEADER, FRAME_TAIL, MAX_PAYLOAD_BYTES};
pub use collector::{CollectorStats, Direction, FrameCollector};
pub use layout::{RegisterLayout, RegisterSpan, CELL_COUNT_REGISTER, IDENTITY_REGISTER_COUNT};
pub use params::{ParamDef, ParamType, ParamValue, FIXED_REGION_PARAMS};
pub use payload::{decode_socket_payload, encode_socket_payload};
pub use transport::{
    BleTransport, BleTransportConfig, BmsTransport, MqttRole, MqttTransport,
    MqttTransportConfig, TransportStats, BLE_CHUNK_SIZE,
};
pub use client::{
    BmsClient, BmsClientConfig, CancelHandle, ClientStats, SharedBmsClient,
    DEFAULT_REQUEST_TIMEOUT, MAX_REGISTERS_PER_REQUEST,
};
pub use simulator::{DeviceSimulator, SimRegisterBank, SimTransport, SimulatorConfig};
pub use bridge::{BmsBridge, BridgeConfig, BridgeHandshake, BridgeStats, WsTransport};
pub use auth::{validate_credentials, AuthDecision, CredentialKind, CredentialRecord};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Default per-request timeout (8 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 8000;

/// MQTT broker default port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage BMS v{} - Battery management protocol stack by Evan Liu", VERSION)
}
