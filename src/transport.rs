//! # BMS Transport Layer
//!
//! This module provides the byte-stream transport abstraction the protocol
//! engine runs over, with implementations for the two production links and
//! statistics shared by all of them.
//!
//! ## Supported Transports
//!
//! ### MQTT (`MqttTransport`)
//! - Per-device topic pair on a message bus (see [`MqttRole`])
//! - Frames wrapped in the JSON hex envelope from [`crate::payload`]
//! - QoS 1 delivery, 30 s keep-alive, cancel-flag driven shutdown
//!
//! ### BLE (`BleTransport`)
//! - Short-range wireless link over a UART-style GATT service
//! - Inbound bytes arrive as chunked notifications; outbound frames are
//!   written in MTU-sized chunks without response
//!
//! The in-process simulator transport lives in [`crate::simulator`] and the
//! WebSocket transport used by the bridge in [`crate::bridge`]; all of them
//! implement [`BmsTransport`], so the engine never depends on a concrete
//! variant.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use voltage_bms::transport::{BmsTransport, MqttTransport, MqttTransportConfig, MqttRole};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MqttTransportConfig {
//!         host: "broker.example.com".to_string(),
//!         device_id: "BMS-0042".to_string(),
//!         role: MqttRole::Host,
//!         ..Default::default()
//!     };
//!
//!     let mut transport = MqttTransport::connect(config).await?;
//!     transport.send(&[0x7F, 0x55, 0x01, 0x40, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B, 0xFD]).await?;
//!     let chunk = transport.recv().await?;
//!     println!("Received {} bytes", chunk.len());
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BmsError, BmsResult};
use crate::payload::{decode_socket_payload, encode_socket_payload};

/// Outbound chunk size for BLE writes (conservative 20-byte MTU payload)
pub const BLE_CHUNK_SIZE: usize = 20;

/// UART-style GATT service carrying the BMS link
pub const BLE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB);

/// Notify characteristic (device → host)
pub const BLE_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFE1_0000_1000_8000_00805F9B34FB);

/// Write characteristic (host → device)
pub const BLE_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000FFE2_0000_1000_8000_00805F9B34FB);

/// Format raw bytes as hex string for packet logging
fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and transport kind
fn log_packet(direction: &str, data: &[u8], transport: &str) {
    debug!("[BMS-{}] {} {}", transport, direction, format_hex_packet(data));
}

/// Transport layer abstraction for BMS communication links
///
/// One implementation per link kind; the engine owns exactly one session and
/// feeds every inbound delivery to its frame collector in arrival order.
/// Deliveries are opaque byte chunks — chunk boundaries carry no meaning.
#[async_trait]
pub trait BmsTransport: Send {
    /// Send raw frame bytes to the remote side
    async fn send(&mut self, data: &[u8]) -> BmsResult<()>;

    /// Await the next inbound delivery
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` once the inbound stream has ended; the
    /// session is unusable afterwards.
    async fn recv(&mut self) -> BmsResult<Vec<u8>>;

    /// Check if the transport connection is active
    ///
    /// This is a local check and does not verify that the remote side is
    /// responsive.
    fn is_connected(&self) -> bool;

    /// Close the transport connection gracefully
    async fn close(&mut self) -> BmsResult<()>;

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub sends: u64,
    pub deliveries: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Which end of the per-device topic pair this session plays
///
/// The device publishes on its `tx` topic and listens on `rx`; a host (or the
/// bridge acting for one) does the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttRole {
    /// Controlling application or bridge
    Host,
    /// Device or device simulator
    Device,
}

impl MqttRole {
    /// Topic this side subscribes to
    pub fn subscribe_topic(self, device_id: &str) -> String {
        match self {
            MqttRole::Host => format!("device/socket/tx/{}", device_id),
            MqttRole::Device => format!("device/socket/rx/{}", device_id),
        }
    }

    /// Topic this side publishes to
    pub fn publish_topic(self, device_id: &str) -> String {
        match self {
            MqttRole::Host => format!("device/socket/rx/{}", device_id),
            MqttRole::Device => format!("device/socket/tx/{}", device_id),
        }
    }
}

/// MQTT transport configuration
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Broker hostname
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Username for authentication (optional)
    pub username: Option<String>,
    /// Password for authentication (optional)
    pub password: Option<String>,
    /// Client ID (auto-generated if None)
    pub client_id: Option<String>,
    /// Device identifier selecting the topic pair
    pub device_id: String,
    /// Which end of the topic pair this session is
    pub role: MqttRole,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            device_id: String::new(),
            role: MqttRole::Host,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// MQTT transport implementation
///
/// A background task polls the event loop, unwraps inbound envelopes and
/// hands the frame bytes to `recv` through a channel. Dropping the channel
/// (event-loop error or `close`) surfaces as `ConnectionLost`.
pub struct MqttTransport {
    client: AsyncClient,
    rx: mpsc::Receiver<Vec<u8>>,
    publish_topic: String,
    connected: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    stats: TransportStats,
}

impl MqttTransport {
    /// Connect to the broker and subscribe to this session's inbound topic
    pub async fn connect(config: MqttTransportConfig) -> BmsResult<Self> {
        if config.device_id.is_empty() {
            return Err(BmsError::configuration("device_id must not be empty"));
        }

        let client_id = config.client_id.clone().unwrap_or_else(|| {
            format!("voltage-bms-{}", Uuid::new_v4().simple())
        });

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        let subscribe_topic = config.role.subscribe_topic(&config.device_id);
        let publish_topic = config.role.publish_topic(&config.device_id);

        client.subscribe(&subscribe_topic, QoS::AtLeastOnce).await
            .map_err(|e| BmsError::connection(format!(
                "failed to subscribe to {}: {}", subscribe_topic, e
            )))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = Arc::new(AtomicBool::new(false));

        let task_connected = connected.clone();
        let task_cancel = cancel.clone();
        let task_topic = subscribe_topic.clone();
        tokio::spawn(async move {
            loop {
                if task_cancel.load(Ordering::Relaxed) {
                    break;
                }

                // Poll with timeout so the cancel flag is checked periodically
                match tokio::time::timeout(Duration::from_millis(100), eventloop.poll()).await {
                    Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        match decode_socket_payload(&publish.payload) {
                            Ok(frame_bytes) => {
                                log_packet("recv", &frame_bytes, "MQTT");
                                if tx.send(frame_bytes).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("undecodable payload on '{}': {}", publish.topic, e);
                            }
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!("MQTT connection error on '{}': {}", task_topic, e);
                        break;
                    }
                    Err(_) => {}
                }
            }
            task_connected.store(false, Ordering::Relaxed);
            // tx dropped here; pending recv() resolves as ConnectionLost
        });

        info!("MQTT session up: {}:{} sub='{}' pub='{}'",
              config.host, config.port, subscribe_topic, publish_topic);

        Ok(Self {
            client,
            rx,
            publish_topic,
            connected,
            cancel,
            stats: TransportStats::default(),
        })
    }
}

#[async_trait]
impl BmsTransport for MqttTransport {
    async fn send(&mut self, data: &[u8]) -> BmsResult<()> {
        log_packet("send", data, "MQTT");
        let payload = encode_socket_payload(data);
        let payload_len = payload.len();
        self.client
            .publish(&self.publish_topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| {
                self.stats.errors += 1;
                BmsError::io(format!("MQTT publish failed: {}", e))
            })?;

        self.stats.sends += 1;
        self.stats.bytes_sent += payload_len as u64;
        Ok(())
    }

    async fn recv(&mut self) -> BmsResult<Vec<u8>> {
        match self.rx.recv().await {
            Some(chunk) => {
                self.stats.deliveries += 1;
                self.stats.bytes_received += chunk.len() as u64;
                Ok(chunk)
            }
            None => {
                self.stats.errors += 1;
                Err(BmsError::connection_lost("MQTT event loop ended"))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&mut self) -> BmsResult<()> {
        self.cancel.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.client.disconnect().await;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// BLE transport configuration
#[derive(Debug, Clone)]
pub struct BleTransportConfig {
    /// Advertised local name to match during the scan
    pub device_name: Option<String>,
    /// Peripheral address string to match (exact, case-insensitive)
    pub address: Option<String>,
    /// How long to scan before giving up
    pub scan_timeout: Duration,
    /// Outbound write chunk size
    pub chunk_size: usize,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            address: None,
            scan_timeout: Duration::from_secs(10),
            chunk_size: BLE_CHUNK_SIZE,
        }
    }
}

/// BLE transport implementation
///
/// Notifications from the device are forwarded into a channel by a background
/// task; each notification value is one inbound delivery. Outbound frames are
/// split into `chunk_size` writes without response, so the device-side
/// collector reassembles them the same way ours does.
pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    rx: mpsc::Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    chunk_size: usize,
    stats: TransportStats,
}

impl BleTransport {
    /// Scan for, connect to, and subscribe to the configured peripheral
    pub async fn connect(config: BleTransportConfig) -> BmsResult<Self> {
        if config.device_name.is_none() && config.address.is_none() {
            return Err(BmsError::configuration(
                "BLE config needs a device name or an address"
            ));
        }

        let manager = Manager::new().await
            .map_err(|e| BmsError::connection(format!("BLE manager init failed: {}", e)))?;
        let adapter = manager.adapters().await
            .map_err(|e| BmsError::connection(format!("failed to list BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BmsError::connection("no BLE adapter found"))?;

        adapter.start_scan(ScanFilter::default()).await
            .map_err(|e| BmsError::connection(format!("BLE scan failed: {}", e)))?;
        tokio::time::sleep(config.scan_timeout).await;
        let _ = adapter.stop_scan().await;

        let peripherals = adapter.peripherals().await
            .map_err(|e| BmsError::connection(format!("failed to enumerate peripherals: {}", e)))?;

        let mut found = None;
        for peripheral in peripherals {
            if Self::matches(&peripheral, &config).await {
                found = Some(peripheral);
                break;
            }
        }
        let peripheral = found.ok_or_else(|| BmsError::connection("BLE peripheral not found"))?;

        peripheral.connect().await
            .map_err(|e| BmsError::connection(format!("BLE connect failed: {}", e)))?;
        peripheral.discover_services().await
            .map_err(|e| BmsError::connection(format!("BLE service discovery failed: {}", e)))?;

        let characteristics = peripheral.characteristics();
        let notify_char = characteristics.iter()
            .find(|c| c.uuid == BLE_NOTIFY_CHAR_UUID)
            .cloned()
            .ok_or_else(|| BmsError::connection("notify characteristic not found"))?;
        let write_char = characteristics.iter()
            .find(|c| c.uuid == BLE_WRITE_CHAR_UUID)
            .cloned()
            .ok_or_else(|| BmsError::connection("write characteristic not found"))?;

        peripheral.subscribe(&notify_char).await
            .map_err(|e| BmsError::connection(format!("BLE subscribe failed: {}", e)))?;
        let mut notifications = peripheral.notifications().await
            .map_err(|e| BmsError::connection(format!("BLE notification stream failed: {}", e)))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let connected = Arc::new(AtomicBool::new(true));

        let task_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != BLE_NOTIFY_CHAR_UUID {
                    continue;
                }
                log_packet("recv", &notification.value, "BLE");
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            task_connected.store(false, Ordering::Relaxed);
        });

        info!("BLE session up: write char {}", BLE_WRITE_CHAR_UUID);

        Ok(Self {
            peripheral,
            write_char,
            rx,
            connected,
            chunk_size: config.chunk_size.max(1),
            stats: TransportStats::default(),
        })
    }

    async fn matches(peripheral: &Peripheral, config: &BleTransportConfig) -> bool {
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return false,
        };
        if let Some(wanted) = &config.address {
            if peripheral.address().to_string().eq_ignore_ascii_case(wanted) {
                return true;
            }
        }
        if let (Some(wanted), Some(name)) = (&config.device_name, &properties.local_name) {
            if name == wanted {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl BmsTransport for BleTransport {
    async fn send(&mut self, data: &[u8]) -> BmsResult<()> {
        log_packet("send", data, "BLE");
        for chunk in data.chunks(self.chunk_size) {
            self.peripheral
                .write(&self.write_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| {
                    self.stats.errors += 1;
                    BmsError::io(format!("BLE write failed: {}", e))
                })?;
        }
        self.stats.sends += 1;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    async fn recv(&mut self) -> BmsResult<Vec<u8>> {
        match self.rx.recv().await {
            Some(chunk) => {
                self.stats.deliveries += 1;
                self.stats.bytes_received += chunk.len() as u64;
                Ok(chunk)
            }
            None => {
                self.stats.errors += 1;
                Err(BmsError::connection_lost("BLE notification stream ended"))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&mut self) -> BmsResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.peripheral.disconnect().await
            .map_err(|e| BmsError::io(format!("BLE disconnect failed: {}", e)))?;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_pair() {
        assert_eq!(MqttRole::Host.subscribe_topic("BMS-1"), "device/socket/tx/BMS-1");
        assert_eq!(MqttRole::Host.publish_topic("BMS-1"), "device/socket/rx/BMS-1");

        // Device side is the mirror image
        assert_eq!(MqttRole::Device.subscribe_topic("BMS-1"), MqttRole::Host.publish_topic("BMS-1"));
        assert_eq!(MqttRole::Device.publish_topic("BMS-1"), MqttRole::Host.subscribe_topic("BMS-1"));
    }

    #[test]
    fn test_hex_packet_format() {
        assert_eq!(format_hex_packet(&[0x7F, 0x55, 0x01]), "7F 55 01");
    }

    #[tokio::test]
    async fn test_mqtt_rejects_empty_device_id() {
        let config = MqttTransportConfig::default();
        match MqttTransport::connect(config).await {
            Err(BmsError::Configuration { .. }) => {}
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_ble_requires_identity() {
        let config = BleTransportConfig::default();
        match BleTransport::connect(config).await {
            Err(BmsError::Configuration { .. }) => {}
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }
}
