//! publisher - send a start-stream trigger over MQTT
//!
//! Small operator tool for kicking off a capture by hand:
//!
//! ```text
//! publisher --device-id mockdevice
//! publisher --topic motion-detected --device-id cam-3
//! ```

use anyhow::Result;
use clap::Parser;

use device_capture::{MqttBus, MqttSettings, StartStreamMessage};

#[derive(Parser, Debug)]
#[command(name = "publisher", about = "Publish a start-stream trigger")]
struct Args {
    /// MQTT broker host.
    #[arg(long, default_value = "127.0.0.1", env = "MQTT_HOST")]
    host: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// MQTT client identifier.
    #[arg(long, default_value = "capd-publisher")]
    client_id: String,

    /// Topic to publish on.
    #[arg(long, default_value = "start-stream")]
    topic: String,

    /// Device to start capturing from.
    #[arg(long)]
    device_id: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let bus = MqttBus::connect(&MqttSettings {
        host: args.host,
        port: args.port,
        client_id: args.client_id,
    })?;

    let payload = serde_json::to_vec(&StartStreamMessage {
        device_id: args.device_id.clone(),
    })?;
    bus.publisher().publish(&args.topic, payload)?;
    log::info!("published start for device {} on {}", args.device_id, args.topic);

    // Give the client a beat to flush the publish before disconnecting.
    std::thread::sleep(std::time::Duration::from_millis(200));
    bus.disconnect()?;
    Ok(())
}
