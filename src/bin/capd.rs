//! capd - device capture daemon
//!
//! This daemon:
//! 1. Loads configuration and seeds declared devices into the directory
//! 2. Connects to the MQTT broker and subscribes to the start topics
//! 3. Dispatches each start-stream message to the capture coordinator
//! 4. Writes captured frames under the video directory and announces them
//!    on `image/<device>`, with `end-stream/<device>` on teardown

use anyhow::{Context, Result};
use std::sync::Arc;

use device_capture::{
    CancelToken, CapdConfig, CaptureCoordinator, DiskMqttSinkProvider, HttpSourceProvider,
    HttpStreamSource, MqttBus, SqliteDirectory,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = CapdConfig::load()?;

    let directory = SqliteDirectory::open(&cfg.db_path)?;
    for seed in &cfg.devices {
        directory.upsert_device(&seed.into())?;
        let probe = HttpStreamSource::new(&seed.device_url, cfg.stream.clone());
        log::info!(
            "registered device {} at {} (reachable: {})",
            seed.device_id,
            seed.device_url,
            probe.ping()
        );
    }

    let bus = MqttBus::connect(&cfg.mqtt)?;
    bus.subscribe_start_topics()?;

    let coordinator = CaptureCoordinator::new(
        Arc::new(directory),
        Arc::new(DiskMqttSinkProvider::new(
            cfg.video_dir.clone(),
            Some(bus.publisher()),
        )),
        Arc::new(HttpSourceProvider::new(cfg.stream.clone())),
    );

    let root = CancelToken::new();
    let shutdown = root.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        shutdown.cancel();
    })
    .context("install signal handler")?;

    log::info!(
        "capd ready, video dir {}, start timeout {:?}",
        cfg.video_dir.display(),
        cfg.start_timeout
    );
    bus.dispatch(&coordinator, &root, cfg.start_timeout);

    bus.disconnect()?;
    log::info!("capd stopped");
    Ok(())
}
