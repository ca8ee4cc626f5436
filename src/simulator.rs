//! # BMS Device Simulator
//!
//! In-process battery pack: a background task that speaks the device side of
//! the protocol over a channel-backed transport. Used by the demo binary, the
//! integration tests and as a device-role MQTT endpoint for end-to-end bridge
//! testing.
//!
//! The simulator seeds a register bank with a plausible pack (counts, cell
//! voltages, temperatures, identity strings), answers read and write
//! requests, honors address assignment, and optionally emits periodic
//! cloud-socket reports with jittered cell voltages.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use voltage_bms::client::{BmsClient, BmsClientConfig};
//! use voltage_bms::simulator::{DeviceSimulator, SimulatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let simulator = DeviceSimulator::new(SimulatorConfig::default());
//!     let transport = simulator.spawn();
//!
//!     let mut client = BmsClient::new(transport, BmsClientConfig::default());
//!     let (cells, sensors) = client.read_counts().await?;
//!     assert_eq!((cells, sensors), (8, 4));
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::mpsc;

use crate::collector::{Direction, FrameCollector};
use crate::error::{BmsError, BmsResult};
use crate::frame::{data_utils, BmsFunction, CrcMode, Frame, FrameKind};
use crate::layout::{RegisterLayout, CELL_COUNT_REGISTER};
use crate::transport::{BmsTransport, TransportStats};

/// Thread-safe simulated register space
///
/// Only registers explicitly written exist; reading an unmapped register is
/// an addressing error, which the simulator turns into an exception frame.
#[derive(Debug, Clone)]
pub struct SimRegisterBank {
    registers: Arc<RwLock<HashMap<u16, u16>>>,
}

impl SimRegisterBank {
    /// Create an empty bank
    pub fn new() -> Self {
        Self {
            registers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Read `quantity` registers starting at `address`
    pub fn read_registers(&self, address: u16, quantity: u16) -> BmsResult<Vec<u16>> {
        let registers = self.registers.read()
            .map_err(|_| BmsError::internal("Failed to lock register bank"))?;

        let mut result = Vec::with_capacity(quantity as usize);
        for i in 0..quantity {
            let addr = address.wrapping_add(i);
            match registers.get(&addr) {
                Some(&value) => result.push(value),
                None => return Err(BmsError::invalid_address(address, quantity)),
            }
        }
        Ok(result)
    }

    /// Write registers starting at `address`
    pub fn write_registers(&self, address: u16, values: &[u16]) -> BmsResult<()> {
        let mut registers = self.registers.write()
            .map_err(|_| BmsError::internal("Failed to lock register bank"))?;
        for (i, &value) in values.iter().enumerate() {
            registers.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Write a single register
    pub fn set(&self, address: u16, value: u16) -> BmsResult<()> {
        self.write_registers(address, &[value])
    }

    /// Write a text field padded with zero bytes to `register_count` registers
    pub fn set_text(&self, address: u16, register_count: u16, text: &str) -> BmsResult<()> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.truncate(register_count as usize * 2);
        bytes.resize(register_count as usize * 2, 0x00);
        let values = data_utils::bytes_to_registers(&bytes)?;
        self.write_registers(address, &values)
    }
}

impl Default for SimRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Address the simulated pack answers on
    pub device_addr: u8,
    /// Cell count seeded into the count registers
    pub cell_count: u16,
    /// Temperature-sensor count seeded into the count registers
    pub temp_sensor_count: u16,
    /// CRC coverage region used for encoding and decoding
    pub crc_mode: CrcMode,
    /// Emit a cloud-socket report at this interval
    pub report_interval: Option<Duration>,
    /// Split outbound frames into deliveries of this size (stream-boundary
    /// stress for the peer's collector)
    pub chunk_size: Option<usize>,
    /// 16-byte device identifier answered to UUID reads
    pub uuid: [u8; 16],
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_addr: 0x01,
            cell_count: 8,
            temp_sensor_count: 4,
            crc_mode: CrcMode::default(),
            report_interval: None,
            chunk_size: None,
            uuid: *b"VE-SIM-0000-0001",
        }
    }
}

/// Channel-backed transport connected to a running simulator task
pub struct SimTransport {
    to_device: mpsc::Sender<Vec<u8>>,
    from_device: mpsc::Receiver<Vec<u8>>,
    stats: TransportStats,
}

#[async_trait]
impl BmsTransport for SimTransport {
    async fn send(&mut self, data: &[u8]) -> BmsResult<()> {
        self.to_device.send(data.to_vec()).await
            .map_err(|_| BmsError::connection_lost("simulator task ended"))?;
        self.stats.sends += 1;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    async fn recv(&mut self) -> BmsResult<Vec<u8>> {
        match self.from_device.recv().await {
            Some(chunk) => {
                self.stats.deliveries += 1;
                self.stats.bytes_received += chunk.len() as u64;
                Ok(chunk)
            }
            None => Err(BmsError::connection_lost("simulator task ended")),
        }
    }

    fn is_connected(&self) -> bool {
        !self.to_device.is_closed()
    }

    async fn close(&mut self) -> BmsResult<()> {
        self.from_device.close();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Simulated battery pack
pub struct DeviceSimulator {
    config: SimulatorConfig,
    bank: SimRegisterBank,
    layout: RegisterLayout,
}

impl DeviceSimulator {
    /// Create a simulator and seed its register bank
    pub fn new(config: SimulatorConfig) -> Self {
        let bank = SimRegisterBank::new();
        let layout = RegisterLayout::resolve(config.cell_count, config.temp_sensor_count);
        Self::seed(&bank, &layout, &config);
        Self { config, bank, layout }
    }

    /// Handle to the register bank (shared with the running task)
    pub fn bank(&self) -> SimRegisterBank {
        self.bank.clone()
    }

    /// Resolved variable-region layout of the seeded pack
    pub fn layout(&self) -> RegisterLayout {
        self.layout
    }

    fn seed(bank: &SimRegisterBank, layout: &RegisterLayout, config: &SimulatorConfig) {
        // Seeding a fresh bank cannot hit the unmapped-register path
        let _ = bank.set(0x0001, u16::from(config.device_addr));
        let _ = bank.set(0x0002, 0x0103); // firmware 1.3
        let _ = bank.set(0x0100, 3296); // pack voltage, 10 mV units
        let _ = bank.write_registers(0x0101, &data_utils::u32_to_registers(12_500));
        let _ = bank.set(0x0103, 87); // state of charge
        let _ = bank.set(0x0104, 42); // cycle count
        let _ = bank.set(CELL_COUNT_REGISTER, config.cell_count);
        let _ = bank.set(CELL_COUNT_REGISTER + 1, config.temp_sensor_count);

        for i in 0..config.cell_count {
            let _ = bank.set(layout.cell_voltages.start + i, 3300 + i * 2);
        }
        for i in 0..config.temp_sensor_count {
            let _ = bank.set(layout.cell_temperatures.start + i, 2980 + i * 3);
        }

        let _ = bank.set_text(layout.hw_model.start, layout.hw_model.count(), "VE-BMS-2400");
        let _ = bank.set_text(layout.battery_group_id.start, layout.battery_group_id.count(), "GRP-0042");
        let _ = bank.set_text(layout.board_code.start, layout.board_code.count(), "BRD-A17");
        let _ = bank.set_text(layout.bluetooth_mac.start, layout.bluetooth_mac.count(), "AABBCCDDEE");
    }

    /// Start the device task, returning the host-side transport
    pub fn spawn(self) -> SimTransport {
        let (host_tx, device_rx) = mpsc::channel::<Vec<u8>>(64);
        let (device_tx, host_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(run_device(self.config, self.bank, self.layout, device_rx, device_tx));

        SimTransport {
            to_device: host_tx,
            from_device: host_rx,
            stats: TransportStats::default(),
        }
    }
}

async fn run_device(
    config: SimulatorConfig,
    bank: SimRegisterBank,
    layout: RegisterLayout,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    info!("🔋 BMS simulator started (addr=0x{:02X}, {} cells, {} sensors)",
          config.device_addr, config.cell_count, config.temp_sensor_count);

    let mut device_addr = config.device_addr;
    let mut collector = FrameCollector::new(Direction::FromHost, config.crc_mode);

    let mut report_timer = config.report_interval.map(tokio::time::interval);

    loop {
        tokio::select! {
            chunk = inbound.recv() => {
                let chunk = match chunk {
                    Some(c) => c,
                    None => break,
                };
                for request in collector.push(&chunk) {
                    if request.target != device_addr {
                        debug!("ignoring frame for 0x{:02X} (we are 0x{:02X})",
                               request.target, device_addr);
                        continue;
                    }
                    let response = handle_request(&bank, &config, &mut device_addr, &request);
                    if let Some(response) = response {
                        if !deliver(&outbound, &response, &config).await {
                            return;
                        }
                    }
                }
            }
            _ = tick(&mut report_timer) => {
                let report = build_report(&bank, &layout, device_addr);
                if let Some(report) = report {
                    debug!("emitting cloud-socket report");
                    if !deliver(&outbound, &report, &config).await {
                        return;
                    }
                }
            }
        }
    }

    info!("🔋 BMS simulator stopped (addr=0x{:02X})", device_addr);
}

/// Await the next report tick, or pend forever when reporting is off
async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn handle_request(
    bank: &SimRegisterBank,
    config: &SimulatorConfig,
    device_addr: &mut u8,
    request: &Frame,
) -> Option<Frame> {
    let reply_to = request.source;
    let our_addr = *device_addr;

    match (&request.kind, BmsFunction::from_u8(request.function)) {
        (FrameKind::ReadRequest { .. }, Ok(BmsFunction::ReadUuid)) => {
            Some(Frame::read_response(
                reply_to, our_addr, BmsFunction::ReadUuid, config.uuid.to_vec(),
            ))
        }
        (FrameKind::ReadRequest { start, quantity }, Ok(function)) => {
            if *quantity == 0 || *quantity > 125 {
                return Some(Frame::error(reply_to, our_addr, request.function, 0x03));
            }
            match bank.read_registers(*start, *quantity) {
                Ok(values) => Some(Frame::read_response(
                    reply_to, our_addr, function,
                    data_utils::registers_to_bytes(&values),
                )),
                Err(_) => {
                    warn!("read of unmapped range 0x{:04X}+{}", start, quantity);
                    Some(Frame::error(reply_to, our_addr, request.function, 0x02))
                }
            }
        }
        (FrameKind::WriteRequest { start, quantity, data }, Ok(BmsFunction::AssignAddress)) => {
            if data.is_empty() {
                return Some(Frame::error(reply_to, our_addr, request.function, 0x03));
            }
            let new_addr = data[data.len() - 1];
            info!("address reassigned: 0x{:02X} -> 0x{:02X}", our_addr, new_addr);
            *device_addr = new_addr;
            let _ = bank.set(0x0001, u16::from(new_addr));
            Some(Frame::write_response(
                reply_to, new_addr, BmsFunction::AssignAddress, *start, *quantity,
            ))
        }
        (FrameKind::WriteRequest { start, quantity, data }, Ok(BmsFunction::WriteMultiple)) => {
            if data.len() != usize::from(*quantity) * 2 {
                return Some(Frame::error(reply_to, our_addr, request.function, 0x03));
            }
            match data_utils::bytes_to_registers(data)
                .and_then(|values| bank.write_registers(*start, &values))
            {
                Ok(()) => Some(Frame::write_response(
                    reply_to, our_addr, BmsFunction::WriteMultiple, *start, *quantity,
                )),
                Err(_) => Some(Frame::error(reply_to, our_addr, request.function, 0x04)),
            }
        }
        _ => {
            debug!("ignoring frame kind {:?} (function=0x{:02X})", request.kind, request.function);
            None
        }
    }
}

/// Jitter the cell voltages and package them as a cloud-socket report
fn build_report(bank: &SimRegisterBank, layout: &RegisterLayout, device_addr: u8) -> Option<Frame> {
    let span = layout.cell_voltages;
    let mut voltages = bank.read_registers(span.start, span.count()).ok()?;

    let mut rng = rand::thread_rng();
    for voltage in &mut voltages {
        let jitter: i16 = rng.gen_range(-3..=3);
        *voltage = voltage.wrapping_add_signed(jitter);
    }
    bank.write_registers(span.start, &voltages).ok()?;

    Some(Frame::read_response(
        0x00, device_addr, BmsFunction::CloudSocket,
        data_utils::registers_to_bytes(&voltages),
    ))
}

/// Encode and push a frame to the host, honoring the chunking option
async fn deliver(outbound: &mpsc::Sender<Vec<u8>>, frame: &Frame, config: &SimulatorConfig) -> bool {
    let bytes = match frame.encode(config.crc_mode) {
        Ok(b) => b,
        Err(e) => {
            warn!("failed to encode response: {}", e);
            return true;
        }
    };

    match config.chunk_size {
        Some(size) if size > 0 => {
            for chunk in bytes.chunks(size) {
                if outbound.send(chunk.to_vec()).await.is_err() {
                    return false;
                }
            }
            true
        }
        _ => outbound.send(bytes).await.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BmsClient, BmsClientConfig};
    use crate::params::ParamValue;

    fn test_client_config() -> BmsClientConfig {
        BmsClientConfig {
            timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_counts_and_identity() {
        let simulator = DeviceSimulator::new(SimulatorConfig::default());
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        assert_eq!(client.read_counts().await.unwrap(), (8, 4));

        let identity = client.read_identity().await.unwrap();
        assert_eq!(identity["hw_model"], ParamValue::Str("VE-BMS-2400".to_string()));
        assert_eq!(identity["battery_group_id"], ParamValue::Str("GRP-0042".to_string()));
        assert_eq!(identity["board_code"], ParamValue::Str("BRD-A17".to_string()));
        assert_eq!(identity["bluetooth_mac"], ParamValue::Str("AABBCCDDEE".to_string()));
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let simulator = DeviceSimulator::new(SimulatorConfig::default());
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        client.write_registers(0x0104, &[100]).await.unwrap();
        let registers = client.read_holding_registers(0x0104, 1).await.unwrap();
        assert_eq!(registers, vec![100]);
    }

    #[tokio::test]
    async fn test_unmapped_read_is_exception() {
        let simulator = DeviceSimulator::new(SimulatorConfig::default());
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        match client.read_holding_registers(0x7000, 4).await {
            Err(BmsError::Exception { code, .. }) => assert_eq!(code, 0x02),
            other => panic!("expected Exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunked_delivery() {
        let simulator = DeviceSimulator::new(SimulatorConfig {
            chunk_size: Some(3),
            ..Default::default()
        });
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        // 53-register identity read crosses many 3-byte deliveries
        let identity = client.read_identity().await.unwrap();
        assert_eq!(identity["hw_model"], ParamValue::Str("VE-BMS-2400".to_string()));
    }

    #[tokio::test]
    async fn test_assign_address() {
        let simulator = DeviceSimulator::new(SimulatorConfig::default());
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        client.assign_address(0x05).await.unwrap();

        // The session follows the new address
        assert_eq!(client.read_counts().await.unwrap(), (8, 4));
        let registers = client.read_holding_registers(0x0001, 1).await.unwrap();
        assert_eq!(registers, vec![0x0005]);
    }

    #[tokio::test]
    async fn test_read_uuid() {
        let simulator = DeviceSimulator::new(SimulatorConfig::default());
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());

        let uuid = client.read_uuid().await.unwrap();
        assert_eq!(uuid, b"VE-SIM-0000-0001".to_vec());
    }

    #[tokio::test]
    async fn test_spontaneous_reports() {
        let simulator = DeviceSimulator::new(SimulatorConfig {
            report_interval: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let transport = simulator.spawn();
        let mut client = BmsClient::new(transport, test_client_config());
        let mut reports = client.take_report_receiver().unwrap();

        // Reports only surface while the client is pumping the transport, so
        // issue requests until one has been forwarded.
        let mut forwarded = None;
        for _ in 0..50 {
            let _ = client.read_counts().await.unwrap();
            if let Ok(report) = reports.try_recv() {
                forwarded = Some(report);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = forwarded.expect("no report forwarded");
        assert_eq!(report.function, BmsFunction::CloudSocket.to_u8());
        match report.kind {
            FrameKind::ReadResponse { data } => assert_eq!(data.len(), 16), // 8 cells
            other => panic!("unexpected report kind: {:?}", other),
        }
    }
}
