//! Message-bus trigger and publisher.
//!
//! Capture never starts on its own: an MQTT message on one of the start
//! topics carries a `{"device_id": ...}` payload, and each message maps 1:1
//! to one `start_stream` call. The transport is kept out of the orchestration
//! path: the connection event loop runs on its own thread and forwards
//! inbound publishes onto an explicit command channel, which a dedicated
//! dispatch loop drains, calling the coordinator synchronously per message.

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event, MqttOptions};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::coordinator::CaptureCoordinator;

/// Topics that trigger a capture start.
pub const START_TOPICS: [&str; 2] = ["start-stream", "motion-detected"];

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Payload of a start-stream message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartStreamMessage {
    pub device_id: String,
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "capd".to_string(),
        }
    }
}

/// Cloneable publish handle, shared by frame sinks and the publisher CLI.
#[derive(Clone)]
pub struct MqttPublisher {
    client: Client,
}

impl MqttPublisher {
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into())
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

/// One inbound publish, decoupled from the MQTT packet types.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT connection with its event loop drained on a background thread.
///
/// Inbound publishes land on a bounded command queue; a full queue drops the
/// message with a warning rather than stalling the broker connection.
pub struct MqttBus {
    client: Client,
    commands: Receiver<BusMessage>,
    conn_thread: Option<JoinHandle<()>>,
}

impl MqttBus {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);

        let (client, mut connection) = Client::new(options, 10);
        let (tx, rx) = mpsc::sync_channel(COMMAND_QUEUE_CAPACITY);
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = BusMessage {
                            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.try_send(msg).is_err() {
                            log::warn!("command queue full or closed, dropping bus message");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("mqtt connection error: {}", e);
                        break;
                    }
                }
            }
        });

        log::info!(
            "connected to mqtt broker {}:{} as {}",
            settings.host,
            settings.port,
            settings.client_id
        );
        Ok(Self {
            client,
            commands: rx,
            conn_thread: Some(handle),
        })
    }

    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    pub fn subscribe_start_topics(&self) -> Result<()> {
        for topic in START_TOPICS {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .with_context(|| format!("subscribe to {}", topic))?;
        }
        Ok(())
    }

    /// Drain start-stream commands until the root token is cancelled.
    ///
    /// Each message gets a child token bounded by `start_timeout`, and the
    /// coordinator runs the capture to completion before the next message is
    /// taken. Malformed payloads and failed starts are logged and skipped.
    pub fn dispatch(
        &self,
        coordinator: &CaptureCoordinator,
        root: &CancelToken,
        start_timeout: Duration,
    ) {
        loop {
            if root.is_cancelled() {
                return;
            }
            let msg = match self.commands.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            };
            let parsed: StartStreamMessage = match serde_json::from_slice(&msg.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("invalid payload on {}: {}", msg.topic, e);
                    continue;
                }
            };
            log::info!(
                "start requested for device {} via {}",
                parsed.device_id,
                msg.topic
            );
            let token = root.child_with_timeout(start_timeout);
            if let Err(e) = coordinator.start_stream(&token, &parsed.device_id) {
                log::warn!("start-stream for device {} failed: {}", parsed.device_id, e);
            }
        }
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.client.disconnect()?;
        if let Some(handle) = self.conn_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}
