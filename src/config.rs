use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::MqttSettings;
use crate::directory::DeviceRecord;
use crate::stream::StreamSettings;

const DEFAULT_DB_PATH: &str = "devices.db";
const DEFAULT_VIDEO_DIR: &str = "videos";
const DEFAULT_MQTT_HOST: &str = "127.0.0.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "capd";
const DEFAULT_START_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DEVICE_ID: &str = "mockdevice";
const DEFAULT_DEVICE_URL: &str = "http://localhost:8080";

#[derive(Debug, Deserialize, Default)]
struct CapdConfigFile {
    db_path: Option<String>,
    video_dir: Option<PathBuf>,
    start_timeout_secs: Option<u64>,
    mqtt: Option<MqttConfigFile>,
    stream: Option<StreamConfigFile>,
    devices: Option<Vec<DeviceSeed>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    decode_backoff_ms: Option<u64>,
}

/// Device declared in the config file, upserted into the directory at
/// daemon startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    pub device_id: String,
    pub name: String,
    pub device_url: String,
}

impl From<&DeviceSeed> for DeviceRecord {
    fn from(seed: &DeviceSeed) -> Self {
        DeviceRecord {
            id: seed.device_id.clone(),
            name: seed.name.clone(),
            url: seed.device_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapdConfig {
    pub db_path: String,
    pub video_dir: PathBuf,
    pub mqtt: MqttSettings,
    pub stream: StreamSettings,
    /// Per-capture deadline applied to each start-stream request.
    pub start_timeout: Duration,
    pub devices: Vec<DeviceSeed>,
}

impl CapdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CapdConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let video_dir = file
            .video_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR));
        let mqtt = MqttSettings {
            host: file
                .mqtt
                .as_ref()
                .and_then(|mqtt| mqtt.host.clone())
                .unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: file
                .mqtt
                .as_ref()
                .and_then(|mqtt| mqtt.port)
                .unwrap_or(DEFAULT_MQTT_PORT),
            client_id: file
                .mqtt
                .and_then(|mqtt| mqtt.client_id)
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
        };
        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            connect_timeout: file
                .stream
                .as_ref()
                .and_then(|stream| stream.connect_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            read_timeout: file
                .stream
                .as_ref()
                .and_then(|stream| stream.read_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.read_timeout),
            decode_backoff: file
                .stream
                .and_then(|stream| stream.decode_backoff_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.decode_backoff),
        };
        let start_timeout = Duration::from_secs(
            file.start_timeout_secs
                .unwrap_or(DEFAULT_START_TIMEOUT_SECS),
        );
        let devices = file.devices.unwrap_or_else(|| {
            vec![DeviceSeed {
                device_id: DEFAULT_DEVICE_ID.to_string(),
                name: "Mock Device".to_string(),
                device_url: DEFAULT_DEVICE_URL.to_string(),
            }]
        });
        Self {
            db_path,
            video_dir,
            mqtt,
            stream,
            start_timeout,
            devices,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            let host = host.trim().trim_matches('\'');
            if !host.is_empty() {
                let (name, port) = split_host_port(host)
                    .ok_or_else(|| anyhow!("MQTT_HOST is malformed: {}", host))?;
                self.mqtt.host = name.to_string();
                if let Some(port) = port {
                    self.mqtt.port = port;
                }
            }
        }
        if let Ok(path) = std::env::var("CAPD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("CAPD_VIDEO_DIR") {
            if !dir.trim().is_empty() {
                self.video_dir = PathBuf::from(dir);
            }
        }
        if let Ok(timeout) = std::env::var("CAPD_START_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("CAPD_START_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.start_timeout = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.start_timeout.is_zero() {
            return Err(anyhow!("start timeout must be greater than zero"));
        }
        if self.stream.connect_timeout.is_zero() || self.stream.read_timeout.is_zero() {
            return Err(anyhow!("stream timeouts must be greater than zero"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("mqtt host must not be empty"));
        }
        Ok(())
    }
}

/// Split `host`, `host:port`, `[v6addr]`, or `[v6addr]:port`. A bare IPv6
/// literal such as `::1` is a host with no port, never host + port.
fn split_host_port(value: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']')?;
        if tail.is_empty() {
            return Some((addr, None));
        }
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((addr, Some(port)));
    }
    match value.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => {
            let port = port.parse().ok()?;
            Some((name, Some(port)))
        }
        Some(_) => Some((value, None)),
        None => Some((value, None)),
    }
}

fn read_config_file(path: &Path) -> Result<CapdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
