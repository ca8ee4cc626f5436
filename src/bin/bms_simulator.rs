/// BMS Device Simulator
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Runs a simulated battery pack as an MQTT device endpoint: the simulator
/// answers on `device/socket/tx/{device_id}` and listens on
/// `device/socket/rx/{device_id}`, so any host-role client (or the bridge)
/// can talk to it as if it were hardware.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use voltage_bms::bridge::relay;
use voltage_bms::simulator::{DeviceSimulator, SimulatorConfig};
use voltage_bms::transport::{MqttRole, MqttTransport, MqttTransportConfig};

struct Args {
    device_id: String,
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    cells: u16,
    temps: u16,
    report_interval: Option<u64>,
    chunk_size: Option<usize>,
    device_addr: u8,
}

fn usage() -> &'static str {
    "Usage: bms_simulator --device-id <ID> [options]\n\
     \n\
     Options:\n\
       --device-id <ID>          Device identifier on the bus (required)\n\
       --host <HOST>             MQTT broker host (default: localhost)\n\
       --port <PORT>             MQTT broker port (default: 1883)\n\
       --username <USER>         MQTT username\n\
       --password <PASS>         MQTT password\n\
       --cells <N>               Cell count (default: 8)\n\
       --temps <N>               Temperature sensor count (default: 4)\n\
       --report-interval <SECS>  Emit cloud-socket reports at this interval\n\
       --chunk-size <BYTES>      Split outbound frames into deliveries\n\
       --addr <HEX>              Device address byte (default: 01)"
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        device_id: String::new(),
        host: "localhost".to_string(),
        port: 1883,
        username: None,
        password: None,
        cells: 8,
        temps: 4,
        report_interval: None,
        chunk_size: None,
        device_addr: 0x01,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next().with_context(|| format!("missing value for {}", name))
        };
        match flag.as_str() {
            "--device-id" => args.device_id = value("--device-id")?,
            "--host" => args.host = value("--host")?,
            "--port" => args.port = value("--port")?.parse().context("bad --port")?,
            "--username" => args.username = Some(value("--username")?),
            "--password" => args.password = Some(value("--password")?),
            "--cells" => args.cells = value("--cells")?.parse().context("bad --cells")?,
            "--temps" => args.temps = value("--temps")?.parse().context("bad --temps")?,
            "--report-interval" => {
                args.report_interval = Some(value("--report-interval")?.parse().context("bad --report-interval")?)
            }
            "--chunk-size" => {
                args.chunk_size = Some(value("--chunk-size")?.parse().context("bad --chunk-size")?)
            }
            "--addr" => {
                args.device_addr = u8::from_str_radix(&value("--addr")?, 16).context("bad --addr")?
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => bail!("unknown flag '{}'\n\n{}", other, usage()),
        }
    }

    if args.device_id.is_empty() {
        bail!("--device-id is required\n\n{}", usage());
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = parse_args()?;

    println!("🔋 BMS Simulator");
    println!("================");
    println!("Device:  {} (addr 0x{:02X})", args.device_id, args.device_addr);
    println!("Broker:  {}:{}", args.host, args.port);
    println!("Pack:    {} cells, {} sensors", args.cells, args.temps);

    let simulator = DeviceSimulator::new(SimulatorConfig {
        device_addr: args.device_addr,
        cell_count: args.cells,
        temp_sensor_count: args.temps,
        report_interval: args.report_interval.map(Duration::from_secs),
        chunk_size: args.chunk_size,
        ..Default::default()
    });
    let mut pack = simulator.spawn();

    let mut mqtt = MqttTransport::connect(MqttTransportConfig {
        host: args.host,
        port: args.port,
        username: args.username,
        password: args.password,
        client_id: Some(format!("bms-sim-{}", args.device_id)),
        device_id: args.device_id.clone(),
        role: MqttRole::Device,
        keep_alive: Duration::from_secs(30),
    })
    .await
    .context("failed to reach the MQTT broker")?;

    info!("simulated pack '{}' is on the bus", args.device_id);
    println!("✅ On the bus, press Ctrl-C to stop");

    tokio::select! {
        result = relay(&mut pack, &mut mqtt) => {
            result.context("relay ended")?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n👋 Stopping simulator");
        }
    }

    Ok(())
}
