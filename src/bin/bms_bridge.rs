/// BMS WebSocket Bridge
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Serves WebSocket clients and relays their frame bytes to per-device MQTT
/// topic pairs after a credential handshake.

use anyhow::{bail, Context, Result};
use voltage_bms::auth::{CredentialKind, CredentialRecord};
use voltage_bms::bridge::{BmsBridge, BridgeConfig};

fn usage() -> &'static str {
    "Usage: bms_bridge [options]\n\
     \n\
     Options:\n\
       --bind <ADDR>        Listen address (default: 127.0.0.1:9001)\n\
       --mqtt-host <HOST>   MQTT broker host (default: localhost)\n\
       --mqtt-port <PORT>   MQTT broker port (default: 1883)\n\
       --mqtt-user <USER>   MQTT broker username\n\
       --mqtt-pass <PASS>   MQTT broker password\n\
       --token <TOKEN>      Accept an access token (repeatable)\n\
       --api-key <KEY>      Accept the deployment API key"
}

fn parse_args() -> Result<BridgeConfig> {
    let mut config = BridgeConfig::default();

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next().with_context(|| format!("missing value for {}", name))
        };
        match flag.as_str() {
            "--bind" => config.bind_address = value("--bind")?,
            "--mqtt-host" => config.mqtt_host = value("--mqtt-host")?,
            "--mqtt-port" => config.mqtt_port = value("--mqtt-port")?.parse().context("bad --mqtt-port")?,
            "--mqtt-user" => config.mqtt_username = Some(value("--mqtt-user")?),
            "--mqtt-pass" => config.mqtt_password = Some(value("--mqtt-pass")?),
            "--token" => {
                config.credentials.push(CredentialRecord {
                    kind: CredentialKind::AccessToken,
                    username: value("--token")?,
                    password: String::new(),
                });
            }
            "--api-key" => config.api_key = Some(value("--api-key")?),
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => bail!("unknown flag '{}'\n\n{}", other, usage()),
        }
    }

    if config.credentials.is_empty() && config.api_key.is_none() {
        bail!("at least one --token or an --api-key is required\n\n{}", usage());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = parse_args()?;

    println!("🌉 BMS Bridge");
    println!("=============");
    println!("Listening: {}", config.bind_address);
    println!("Broker:    {}:{}", config.mqtt_host, config.mqtt_port);
    let key_count = usize::from(config.api_key.is_some());
    println!("Clients:   {} credential(s) accepted", config.credentials.len() + key_count);

    let bridge = BmsBridge::new(config);

    tokio::select! {
        result = bridge.run() => {
            result.context("bridge stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n👋 Shutting down bridge");
            bridge.shutdown();
        }
    }

    Ok(())
}
