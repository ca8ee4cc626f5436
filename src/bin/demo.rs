/// Voltage BMS Demo
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// This program demonstrates basic usage of the voltage_bms library against
/// the in-process device simulator.

use std::time::Duration;
use voltage_bms::simulator::{DeviceSimulator, SimulatorConfig};
use voltage_bms::{BmsClient, BmsClientConfig, CallbackLogger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("🔋 Voltage BMS Demo");
    println!("===================");

    let simulator = DeviceSimulator::new(SimulatorConfig {
        cell_count: 8,
        temp_sensor_count: 4,
        report_interval: Some(Duration::from_secs(2)),
        ..Default::default()
    });
    let transport = simulator.spawn();

    let mut client = BmsClient::new(transport, BmsClientConfig::default());
    client.set_logger(CallbackLogger::console());
    let mut reports = client.take_report_receiver()
        .ok_or("report receiver already taken")?;

    println!("\n📖 Discovering pack geometry...");
    let (cells, sensors) = client.read_counts().await?;
    println!("✅ Pack reports {} cells and {} temperature sensors", cells, sensors);

    println!("\n🪪 Reading identity block...");
    let identity = client.read_identity().await?;
    println!("{}", serde_json::to_string_pretty(&identity)?);

    println!("\n📈 Reading telemetry range 0x0100..0x0105...");
    let telemetry = client.read_range(0x0100, 5).await?;
    println!("{}", serde_json::to_string_pretty(&telemetry)?);

    println!("\n✏️  Writing cycle count...");
    client.write_registers(0x0104, &[43]).await?;
    let cycle = client.read_holding_registers(0x0104, 1).await?;
    println!("✅ Cycle count is now {}", cycle[0]);

    println!("\n🔑 Reading device UUID...");
    let uuid = client.read_uuid().await?;
    println!("✅ UUID: {}", hex::encode_upper(&uuid));

    println!("\n📡 Waiting for a spontaneous report (pumping reads)...");
    let mut report = None;
    for _ in 0..40 {
        let _ = client.read_counts().await?;
        if let Ok(frame) = reports.try_recv() {
            report = Some(frame);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    match report {
        Some(frame) => println!("✅ Cloud-socket report received (function 0x{:02X})", frame.function),
        None => println!("⚠️  No report arrived in time"),
    }

    let stats = client.get_stats();
    println!("\n📊 Session statistics:");
    println!("  Requests sent:      {}", stats.requests_sent);
    println!("  Responses received: {}", stats.responses_received);
    println!("  Reports received:   {}", stats.reports_received);
    println!("  Timeouts:           {}", stats.timeouts);

    client.close().await?;
    println!("\n👋 Demo complete");
    Ok(())
}
