//! # WebSocket Bridge
//!
//! Accepts WebSocket clients (typically browser dashboards or provisioning
//! tools), authenticates them, and relays raw frame bytes between the socket
//! and the per-device MQTT topic pair. The bridge never parses protocol
//! frames; both legs are byte pipes and the endpoints own framing.
//!
//! Connection lifecycle:
//! 1. WebSocket upgrade
//! 2. First message: JSON handshake with device id and an access token, an
//!    API key, or both — one valid credential is enough
//! 3. On allow: host-role MQTT session for the device, then bidirectional
//!    relay until either leg ends
//! 4. On deny: a status message, then the socket closes
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use voltage_bms::bridge::{BmsBridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = BmsBridge::new(BridgeConfig {
//!         bind_address: "0.0.0.0:9001".to_string(),
//!         ..Default::default()
//!     });
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{validate_credentials, CredentialKind, CredentialRecord};
use crate::error::{BmsError, BmsResult};
use crate::transport::{BmsTransport, MqttRole, MqttTransport, MqttTransportConfig, TransportStats};

/// How long a fresh connection gets to present its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First message a client must send after the WebSocket upgrade
///
/// Either credential field may carry the session: the token is checked
/// against the stored access-token records, the API key against the
/// deployment-wide key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHandshake {
    /// Device whose topic pair this session bridges to
    pub device_id: String,
    /// Access token issued to the device owner
    #[serde(default)]
    pub token: Option<String>,
    /// Shared deployment API key
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Handshake reply sent before relaying starts (or before closing)
#[derive(Debug, Serialize, Deserialize)]
struct HandshakeReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP listen address for WebSocket clients
    pub bind_address: String,
    /// Broker the device side lives on
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// Accepted access tokens (stored as `AccessToken` records)
    pub credentials: Vec<CredentialRecord>,
    /// Deployment-wide API key; `None` disables API-key logins
    pub api_key: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9001".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            credentials: Vec::new(),
            api_key: None,
        }
    }
}

/// Bridge statistics
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub sessions_ended: AtomicU64,
}

/// WebSocket-to-MQTT bridge server
pub struct BmsBridge {
    config: BridgeConfig,
    stats: Arc<BridgeStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BmsBridge {
    /// Create a bridge (does not bind until [`run`](Self::run))
    pub fn new(config: BridgeConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            stats: Arc::new(BridgeStats::default()),
            shutdown_tx,
        }
    }

    /// Statistics handle
    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// Signal the accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind and serve until shut down
    pub async fn run(&self) -> BmsResult<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await
            .map_err(|e| BmsError::connection(format!(
                "failed to bind {}: {}", self.config.bind_address, e
            )))?;

        info!("🌉 BMS bridge listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shut down
    pub async fn serve(&self, listener: TcpListener) -> BmsResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!("📡 New client connected: {}", addr);
                            let config = self.config.clone();
                            let stats = self.stats.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, config, stats.clone()).await {
                                    warn!("session for {} ended with error: {}", addr, e);
                                }
                                stats.sessions_ended.fetch_add(1, Ordering::Relaxed);
                                info!("👋 Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("🌉 BMS bridge shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    config: BridgeConfig,
    stats: Arc<BridgeStats>,
) -> BmsResult<()> {
    let websocket = tokio_tungstenite::accept_async(stream).await
        .map_err(|e| BmsError::connection(format!("WebSocket upgrade failed: {}", e)))?;
    let mut ws = WsTransport::new(websocket);

    let handshake = match read_handshake(&mut ws).await {
        Ok(h) => h,
        Err(e) => {
            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            reply(&mut ws, false, Some(e.to_string())).await;
            return Err(e);
        }
    };

    if !authorize(&config, &handshake) {
        stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
        warn!("🔒 Rejected client for device '{}'", handshake.device_id);
        reply(&mut ws, false, Some("authentication failed".to_string())).await;
        let _ = ws.close().await;
        return Ok(());
    }

    let mut mqtt = MqttTransport::connect(MqttTransportConfig {
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        client_id: None,
        device_id: handshake.device_id.clone(),
        role: MqttRole::Host,
        keep_alive: Duration::from_secs(30),
    }).await?;

    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    reply(&mut ws, true, None).await;
    info!("🔗 Relaying device '{}'", handshake.device_id);

    let result = relay(&mut ws, &mut mqtt).await;
    let _ = mqtt.close().await;
    let _ = ws.close().await;
    result
}

/// One valid credential is enough; the token is tried before the API key
fn authorize(config: &BridgeConfig, handshake: &BridgeHandshake) -> bool {
    if let Some(token) = &handshake.token {
        let record = config.credentials.iter()
            .find(|r| r.kind == CredentialKind::AccessToken && r.username == *token);
        if validate_credentials(record, token, "").is_allowed() {
            return true;
        }
    }
    if let (Some(presented), Some(expected)) = (&handshake.api_key, &config.api_key) {
        if presented.as_bytes() == expected.as_bytes() {
            return true;
        }
    }
    false
}

async fn read_handshake<S>(ws: &mut WsTransport<S>) -> BmsResult<BridgeHandshake>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.recv()).await
        .map_err(|_| BmsError::timeout("bridge handshake", HANDSHAKE_TIMEOUT.as_millis() as u64))??;
    let handshake: BridgeHandshake = serde_json::from_slice(&first)?;
    if handshake.device_id.is_empty() {
        return Err(BmsError::invalid_data("handshake device_id is empty"));
    }
    Ok(handshake)
}

async fn reply<S>(ws: &mut WsTransport<S>, ok: bool, error: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let body = serde_json::to_vec(&HandshakeReply { ok, error }).unwrap_or_default();
    if let Err(e) = ws.send(&body).await {
        debug!("handshake reply not delivered: {}", e);
    }
}

/// Pump bytes both ways until either leg ends
///
/// A lost connection on either side is normal teardown, not an error; other
/// failures propagate.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> BmsResult<()>
where
    A: BmsTransport,
    B: BmsTransport,
{
    loop {
        tokio::select! {
            from_a = a.recv() => {
                match from_a {
                    Ok(chunk) => b.send(&chunk).await?,
                    Err(BmsError::ConnectionLost { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            from_b = b.recv() => {
                match from_b {
                    Ok(chunk) => a.send(&chunk).await?,
                    Err(BmsError::ConnectionLost { .. }) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// WebSocket leg as a byte transport
///
/// Each binary message is one delivery. Text, ping and pong traffic is
/// control noise and skipped; a close frame or stream end is a lost
/// connection.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
    open: bool,
    stats: TransportStats,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an accepted or connected WebSocket
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            open: true,
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl<S> BmsTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> BmsResult<()> {
        self.inner.send(Message::Binary(data.to_vec().into())).await
            .map_err(|e| {
                self.stats.errors += 1;
                self.open = false;
                BmsError::connection_lost(format!("WebSocket send failed: {}", e))
            })?;
        self.stats.sends += 1;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    async fn recv(&mut self) -> BmsResult<Vec<u8>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    self.stats.deliveries += 1;
                    self.stats.bytes_received += bytes.len() as u64;
                    return Ok(bytes.to_vec());
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.open = false;
                    return Err(BmsError::connection_lost("WebSocket closed"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    self.stats.errors += 1;
                    return Err(BmsError::connection_lost(format!("WebSocket error: {}", e)));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> BmsResult<()> {
        self.open = false;
        let _ = self.inner.close(None).await;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
