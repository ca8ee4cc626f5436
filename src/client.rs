//! # BMS Client Implementation
//!
//! High-level request/response engine for talking to a battery pack over any
//! [`BmsTransport`]. The client owns the transport, reassembles inbound bytes
//! through a [`FrameCollector`], and matches responses to the single pending
//! request while routing spontaneous cloud-socket reports to a side channel.
//!
//! ## Features
//!
//! - Generic over transport: the same engine drives MQTT, BLE, the bridge's
//!   WebSocket leg and the in-process simulator
//! - One outstanding request per session, enforced by `&mut self`
//! - Register-map awareness: count discovery, layout resolution and named
//!   parameter reads
//! - Optional callback logging of request/response traffic
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use voltage_bms::client::{BmsClient, BmsClientConfig};
//! use voltage_bms::transport::{MqttTransport, MqttTransportConfig, MqttRole};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
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
//!     println!("pack has {} cells, {} temperature sensors", cells, sensors);
//!
//!     let identity = client.read_identity().await?;
//!     println!("identity: {:?}", identity);
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::collector::{Direction, FrameCollector};
use crate::error::{BmsError, BmsResult};
use crate::frame::{data_utils, BmsFunction, CrcMode, Frame, FrameKind};
use crate::layout::{RegisterLayout, CELL_COUNT_REGISTER, IDENTITY_REGISTER_COUNT};
use crate::logging::CallbackLogger;
use crate::params::{self, ParamValue, FIXED_REGION_PARAMS};
use crate::transport::BmsTransport;

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(8000);

/// Largest register quantity accepted in a single read or write
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Address register written by an address assignment
const DEVICE_ADDRESS_REGISTER: u16 = 0x0001;

/// Client configuration
#[derive(Debug, Clone)]
pub struct BmsClientConfig {
    /// Our own address byte, used as the frame source
    pub host_addr: u8,
    /// Address byte of the pack we are talking to
    pub device_addr: u8,
    /// CRC coverage region for this transport profile
    pub crc_mode: CrcMode,
    /// Accept frames whose CRC validates under the opposite region
    pub allow_crc_fallback: bool,
    /// Per-request deadline
    pub timeout: Duration,
    /// Function code used by the register-map convenience reads
    pub read_function: BmsFunction,
}

impl Default for BmsClientConfig {
    fn default() -> Self {
        Self {
            host_addr: 0x40,
            device_addr: 0x01,
            crc_mode: CrcMode::default(),
            allow_crc_fallback: true,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            read_function: BmsFunction::ReadHolding,
        }
    }
}

/// Client communication statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub reports_received: u64,
    pub timeouts: u64,
    pub exceptions: u64,
}

/// Cancels in-flight requests from another task
#[derive(Clone)]
pub struct CancelHandle {
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Abort the request currently awaiting a response, if any
    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }
}

/// Generic BMS client, parameterized over the transport
pub struct BmsClient<T: BmsTransport> {
    transport: T,
    config: BmsClientConfig,
    collector: FrameCollector,
    pending: VecDeque<Frame>,
    logger: Option<CallbackLogger>,
    cancel: Arc<Notify>,
    report_tx: mpsc::Sender<Frame>,
    report_rx: Option<mpsc::Receiver<Frame>>,
    layout: Option<RegisterLayout>,
    stats: ClientStats,
}

impl<T: BmsTransport> BmsClient<T> {
    /// Create a client over an already-connected transport
    pub fn new(transport: T, config: BmsClientConfig) -> Self {
        let collector = FrameCollector::with_fallback(
            Direction::FromDevice,
            config.crc_mode,
            config.allow_crc_fallback,
        );
        let (report_tx, report_rx) = mpsc::channel(16);
        Self {
            transport,
            config,
            collector,
            pending: VecDeque::new(),
            logger: None,
            cancel: Arc::new(Notify::new()),
            report_tx,
            report_rx: Some(report_rx),
            layout: None,
            stats: ClientStats::default(),
        }
    }

    /// Attach a callback logger for request/response traffic
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = Some(logger);
    }

    /// Handle for cancelling in-flight requests from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { notify: self.cancel.clone() }
    }

    /// Take the spontaneous-report receiver
    ///
    /// Cloud-socket frames (function 0x0F) arriving between responses are
    /// forwarded here. Can only be taken once; until it is drained, reports
    /// beyond the channel capacity are dropped.
    pub fn take_report_receiver(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.report_rx.take()
    }

    /// Client statistics snapshot
    pub fn get_stats(&self) -> ClientStats {
        self.stats.clone()
    }

    /// Access the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one request frame and await its matching response
    ///
    /// Unmatched frames arriving meanwhile are routed (reports) or discarded
    /// (stale responses); a device error frame for our function resolves the
    /// request as an `Exception`.
    async fn request(&mut self, request: Frame, operation: &str) -> BmsResult<Frame> {
        let raw = request.encode(self.config.crc_mode)?;
        if let Some(logger) = &self.logger {
            logger.log_request(&request, &raw);
        }
        self.transport.send(&raw).await?;
        self.stats.requests_sent += 1;

        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let cancel = self.cancel.clone();

        loop {
            while let Some(candidate) = self.pending.pop_front() {
                if let Some(response) = self.route_frame(&request, candidate)? {
                    self.stats.responses_received += 1;
                    if let Some(logger) = &self.logger {
                        logger.log_response(&response, started.elapsed());
                    }
                    return Ok(response);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.timeouts += 1;
                return Err(BmsError::timeout(operation, self.config.timeout.as_millis() as u64));
            }

            tokio::select! {
                _ = cancel.notified() => {
                    return Err(BmsError::Cancelled);
                }
                delivery = tokio::time::timeout(remaining, self.transport.recv()) => {
                    match delivery {
                        Err(_) => {
                            self.stats.timeouts += 1;
                            return Err(BmsError::timeout(
                                operation, self.config.timeout.as_millis() as u64
                            ));
                        }
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(chunk)) => {
                            self.pending.extend(self.collector.push(&chunk));
                        }
                    }
                }
            }
        }
    }

    /// Decide what an inbound frame is: our response, an exception, a report,
    /// or noise. Returns the frame only when it answers `request`.
    fn route_frame(&mut self, request: &Frame, candidate: Frame) -> BmsResult<Option<Frame>> {
        // Spontaneous reports are never responses to a register operation
        if candidate.function == BmsFunction::CloudSocket.to_u8()
            && request.function != BmsFunction::CloudSocket.to_u8()
        {
            self.forward_report(candidate);
            return Ok(None);
        }

        if candidate.is_error() {
            if candidate.function & 0x7F == request.function & 0x7F {
                self.stats.exceptions += 1;
                if let FrameKind::Error { code } = candidate.kind {
                    return Err(BmsError::exception(request.function, code));
                }
            }
            debug!("discarding stale error frame (function=0x{:02X})", candidate.function);
            return Ok(None);
        }

        let matched = match (&request.kind, &candidate.kind) {
            (FrameKind::ReadRequest { quantity, .. }, FrameKind::ReadResponse { data }) => {
                candidate.function == request.function
                    && data.len() == usize::from(*quantity) * 2
            }
            (
                FrameKind::WriteRequest { start, quantity, .. },
                FrameKind::WriteResponse { start: echo_start, quantity: echo_quantity },
            ) => {
                candidate.function == request.function
                    && echo_start == start
                    && echo_quantity == quantity
            }
            _ => false,
        };

        if matched {
            Ok(Some(candidate))
        } else {
            debug!("discarding unmatched frame (function=0x{:02X})", candidate.function);
            Ok(None)
        }
    }

    fn forward_report(&mut self, frame: Frame) {
        self.stats.reports_received += 1;
        if self.report_tx.try_send(frame).is_err() {
            debug!("report channel full or closed, dropping cloud-socket frame");
        }
    }

    /// Read `quantity` registers with an explicit function code
    pub async fn read_registers(
        &mut self,
        function: BmsFunction,
        address: u16,
        quantity: u16,
    ) -> BmsResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_REGISTERS_PER_REQUEST {
            return Err(BmsError::invalid_address(address, quantity));
        }

        let request = Frame::read_request(
            self.config.device_addr,
            self.config.host_addr,
            function,
            address,
            quantity,
        );
        let operation = format!("read {} registers at 0x{:04X}", quantity, address);
        let response = self.request(request, &operation).await?;

        match response.kind {
            FrameKind::ReadResponse { data } => data_utils::bytes_to_registers(&data),
            _ => Err(BmsError::internal("read matched a non-read response")),
        }
    }

    /// Read holding registers (function 0x03)
    pub async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> BmsResult<Vec<u16>> {
        self.read_registers(BmsFunction::ReadHolding, address, quantity).await
    }

    /// Read input registers (function 0x04)
    pub async fn read_input_registers(&mut self, address: u16, quantity: u16) -> BmsResult<Vec<u16>> {
        self.read_registers(BmsFunction::ReadInput, address, quantity).await
    }

    /// Write multiple registers (function 0x10)
    pub async fn write_registers(&mut self, address: u16, registers: &[u16]) -> BmsResult<()> {
        if registers.is_empty() || registers.len() > usize::from(MAX_REGISTERS_PER_REQUEST) {
            return Err(BmsError::invalid_address(address, registers.len() as u16));
        }

        let request = Frame::write_request(
            self.config.device_addr,
            self.config.host_addr,
            BmsFunction::WriteMultiple,
            address,
            registers,
        );
        let operation = format!("write {} registers at 0x{:04X}", registers.len(), address);
        self.request(request, &operation).await?;
        Ok(())
    }

    /// Read the cell and temperature-sensor counts in one 2-register fetch
    pub async fn read_counts(&mut self) -> BmsResult<(u16, u16)> {
        let registers = self
            .read_registers(self.config.read_function, CELL_COUNT_REGISTER, 2)
            .await?;
        Ok((registers[0], registers[1]))
    }

    /// Resolve (and cache) the variable-region layout for this pack
    ///
    /// Re-reads the counts each call; a count change invalidates the cached
    /// layout since it means a different pack identity behind the same link.
    pub async fn resolve_layout(&mut self) -> BmsResult<RegisterLayout> {
        let (cells, sensors) = self.read_counts().await?;
        match self.layout {
            Some(layout) if layout.matches(cells, sensors) => Ok(layout),
            _ => {
                let layout = RegisterLayout::resolve(cells, sensors);
                self.layout = Some(layout);
                Ok(layout)
            }
        }
    }

    /// Read the identity block as named values
    ///
    /// Fetches all identity fields in a single 53-register read.
    pub async fn read_identity(&mut self) -> BmsResult<BTreeMap<String, ParamValue>> {
        let layout = self.resolve_layout().await?;
        let start = layout.hw_model.start;
        let registers = self
            .read_registers(self.config.read_function, start, IDENTITY_REGISTER_COUNT)
            .await?;
        params::decode(&params::identity_defs(&layout), start, IDENTITY_REGISTER_COUNT, &registers)
    }

    /// Read an arbitrary register range and decode every known field in it
    ///
    /// Fixed-region fields always participate; identity fields participate
    /// once a layout has been resolved for this session.
    pub async fn read_range(&mut self, address: u16, quantity: u16) -> BmsResult<BTreeMap<String, ParamValue>> {
        let registers = self
            .read_registers(self.config.read_function, address, quantity)
            .await?;

        let mut values = params::decode(FIXED_REGION_PARAMS, address, quantity, &registers)?;
        if let Some(layout) = self.layout {
            let identity = params::decode(
                &params::identity_defs(&layout), address, quantity, &registers,
            )?;
            values.extend(identity);
        }
        Ok(values)
    }

    /// Assign a new device address (function 0x11)
    ///
    /// On success the session retargets itself to the new address.
    pub async fn assign_address(&mut self, new_addr: u8) -> BmsResult<()> {
        let request = Frame::write_request(
            self.config.device_addr,
            self.config.host_addr,
            BmsFunction::AssignAddress,
            DEVICE_ADDRESS_REGISTER,
            &[u16::from(new_addr)],
        );
        let operation = format!("assign address 0x{:02X}", new_addr);
        self.request(request, &operation).await?;
        self.config.device_addr = new_addr;
        Ok(())
    }

    /// Read the device UUID (function 0xFF)
    ///
    /// Returns the raw 16-byte identifier.
    pub async fn read_uuid(&mut self) -> BmsResult<Vec<u8>> {
        let request = Frame::read_request(
            self.config.device_addr,
            self.config.host_addr,
            BmsFunction::ReadUuid,
            0,
            8,
        );
        let response = self.request(request, "read device uuid").await?;
        match response.kind {
            FrameKind::ReadResponse { data } => Ok(data),
            _ => Err(BmsError::internal("uuid read matched a non-read response")),
        }
    }

    /// Cancel any in-flight request and close the transport
    pub async fn close(&mut self) -> BmsResult<()> {
        self.cancel.notify_waiters();
        self.transport.close().await
    }
}

/// Clonable handle sharing one client between tasks
///
/// Acquisition is non-blocking: while one task holds the session, others get
/// `Busy` immediately instead of queueing behind a slow pack.
pub struct SharedBmsClient<T: BmsTransport> {
    inner: Arc<Mutex<BmsClient<T>>>,
}

impl<T: BmsTransport> Clone for SharedBmsClient<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: BmsTransport> SharedBmsClient<T> {
    /// Wrap a client for sharing
    pub fn new(client: BmsClient<T>) -> Self {
        Self { inner: Arc::new(Mutex::new(client)) }
    }

    /// Acquire the session, failing fast if it is in use
    pub fn try_lock(&self) -> BmsResult<MutexGuard<'_, BmsClient<T>>> {
        self.inner.try_lock().map_err(|_| BmsError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportStats;
    use async_trait::async_trait;

    /// Channel-backed transport: the test queues inbound deliveries and
    /// inspects what the client sent.
    struct MockTransport {
        inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    fn mock_pair() -> (MockTransport, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (MockTransport { inbound: in_rx, outbound: out_tx }, in_tx, out_rx)
    }

    #[async_trait]
    impl BmsTransport for MockTransport {
        async fn send(&mut self, data: &[u8]) -> BmsResult<()> {
            self.outbound.send(data.to_vec()).map_err(|_| BmsError::connection_lost("test sink gone"))
        }

        async fn recv(&mut self) -> BmsResult<Vec<u8>> {
            self.inbound.recv().await.ok_or_else(|| BmsError::connection_lost("test source gone"))
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> BmsResult<()> {
            self.inbound.close();
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn test_config() -> BmsClientConfig {
        BmsClientConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_registers() {
        let (transport, in_tx, mut out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, test_config());

        let response = Frame::read_response(0x40, 0x01, BmsFunction::ReadHolding,
                                            vec![0x00, 0x08, 0x00, 0x04]);
        in_tx.send(response.encode(CrcMode::AfterHeader).unwrap()).await.unwrap();

        let registers = client.read_registers(BmsFunction::ReadHolding, 0x013F, 2).await.unwrap();
        assert_eq!(registers, vec![8, 4]);

        let sent = out_rx.recv().await.unwrap();
        let request = Frame::decode(&sent, CrcMode::AfterHeader, false).unwrap();
        assert_eq!(request.kind, FrameKind::ReadRequest { start: 0x013F, quantity: 2 });
        assert_eq!(request.target, 0x01);
        assert_eq!(request.source, 0x40);
    }

    #[tokio::test]
    async fn test_write_registers() {
        let (transport, in_tx, mut out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, test_config());

        let echo = Frame::write_response(0x40, 0x01, BmsFunction::WriteMultiple, 0x0200, 2);
        in_tx.send(echo.encode(CrcMode::AfterHeader).unwrap()).await.unwrap();

        client.write_registers(0x0200, &[0x1234, 0x5678]).await.unwrap();

        let sent = out_rx.recv().await.unwrap();
        let request = Frame::decode(&sent, CrcMode::AfterHeader, false).unwrap();
        match request.kind {
            FrameKind::WriteRequest { start, quantity, data } => {
                assert_eq!(start, 0x0200);
                assert_eq!(quantity, 2);
                assert_eq!(data, vec![0x12, 0x34, 0x56, 0x78]);
            }
            other => panic!("unexpected request kind: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exception_response() {
        let (transport, in_tx, _out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, test_config());

        let error = Frame::error(0x40, 0x01, 0x03, 0x02);
        in_tx.send(error.encode(CrcMode::AfterHeader).unwrap()).await.unwrap();

        match client.read_holding_registers(0xFFF0, 4).await {
            Err(BmsError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected Exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (transport, _in_tx, _out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, BmsClientConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        });

        match client.read_holding_registers(0x0100, 1).await {
            Err(BmsError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_report_forwarded_during_request() {
        let (transport, in_tx, _out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, test_config());
        let mut reports = client.take_report_receiver().unwrap();

        // A spontaneous report lands before the actual response
        let report = Frame::read_response(0x40, 0x01, BmsFunction::CloudSocket,
                                          vec![0x0C, 0xE4]);
        let response = Frame::read_response(0x40, 0x01, BmsFunction::ReadHolding,
                                            vec![0x00, 0x10]);
        let mut wire = report.encode(CrcMode::AfterHeader).unwrap();
        wire.extend(response.encode(CrcMode::AfterHeader).unwrap());
        in_tx.send(wire).await.unwrap();

        let registers = client.read_holding_registers(0x0100, 1).await.unwrap();
        assert_eq!(registers, vec![0x0010]);

        let forwarded = reports.recv().await.unwrap();
        assert_eq!(forwarded, report);
        assert_eq!(client.get_stats().reports_received, 1);
    }

    #[tokio::test]
    async fn test_mismatched_response_is_discarded() {
        let (transport, in_tx, _out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, BmsClientConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        });

        // Wrong length for the request below: must be ignored, not returned
        let stale = Frame::read_response(0x40, 0x01, BmsFunction::ReadHolding,
                                         vec![0x00, 0x08]);
        in_tx.send(stale.encode(CrcMode::AfterHeader).unwrap()).await.unwrap();

        match client.read_holding_registers(0x0100, 2).await {
            Err(BmsError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_quantity_validation() {
        let (transport, _in_tx, _out_rx) = mock_pair();
        let mut client = BmsClient::new(transport, test_config());

        assert!(matches!(
            client.read_holding_registers(0, 0).await,
            Err(BmsError::InvalidAddress { .. })
        ));
        assert!(matches!(
            client.read_holding_registers(0, MAX_REGISTERS_PER_REQUEST + 1).await,
            Err(BmsError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_client_busy() {
        let (transport, _in_tx, _out_rx) = mock_pair();
        let shared = SharedBmsClient::new(BmsClient::new(transport, test_config()));

        let guard = shared.try_lock().unwrap();
        let second = shared.clone();
        assert!(matches!(second.try_lock(), Err(BmsError::Busy)));
        drop(guard);
        assert!(second.try_lock().is_ok());
    }
}
