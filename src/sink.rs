//! Frame sinks.
//!
//! A sink owns capture-session bookkeeping and receives frames one at a time
//! from the delivery stage. The pipeline only requests session begin/end; the
//! sink is the source of truth for the session record.

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::bus::MqttPublisher;
use crate::directory::DeviceRecord;
use crate::frame::Frame;
use crate::now_millis;

/// Bookkeeping record for one capture run, owned by the sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub device_id: String,
    pub started_at_ms: i64,
}

/// Destination for captured frames.
///
/// `start_session` is called exactly once per capture run before any frame is
/// delivered. `end_session` is called on every teardown path; when no session
/// is active it is a no-op, so unconditional cleanup cannot fail spuriously.
/// Distinct sink instances may run concurrently for different devices; one
/// instance is never driven concurrently for the same device.
pub trait FrameSink: Send {
    fn start_session(&mut self, device_id: &str) -> Result<SessionInfo>;
    fn end_session(&mut self) -> Result<()>;
    fn receive_frame(&mut self, frame: Frame) -> Result<()>;
}

pub type SharedSink = Arc<Mutex<dyn FrameSink>>;

/// Hands out one sink per device; the coordinator asks for a fresh sink for
/// every capture run.
pub trait SinkProvider: Send + Sync {
    fn sink_for(&self, device: &DeviceRecord) -> SharedSink;
}

// -------------------- Disk + MQTT sink --------------------

/// Frame notification published on `image/<device_id>` after each write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameMsg {
    pub device_id: String,
    pub file_name: String,
    pub timestamp: i64,
}

/// Sink that writes frames under `<video_dir>/<device>-<started_at>/` and,
/// when a publisher is attached, announces each frame on `image/<device>`
/// and the finished session on `end-stream/<device>`.
pub struct DiskMqttSink {
    video_dir: PathBuf,
    publisher: Option<MqttPublisher>,
    session: Option<SessionInfo>,
}

impl DiskMqttSink {
    pub fn new(video_dir: impl Into<PathBuf>, publisher: Option<MqttPublisher>) -> Self {
        Self {
            video_dir: video_dir.into(),
            publisher,
            session: None,
        }
    }

    fn session_dir(&self, session: &SessionInfo) -> PathBuf {
        self.video_dir
            .join(format!("{}-{}", session.device_id, session.started_at_ms))
    }

    fn frame_path(&self, session: &SessionInfo, timestamp_ms: i64) -> PathBuf {
        self.session_dir(session).join(format!(
            "output-{}-{}.jpeg",
            session.device_id, timestamp_ms
        ))
    }

    fn write_frame(path: &Path, frame: &Frame) -> Result<()> {
        match &frame.image {
            Some(image) => {
                let mut file = File::create(path)
                    .with_context(|| format!("create frame file {}", path.display()))?;
                image
                    .write_to(&mut file, ImageFormat::Jpeg)
                    .with_context(|| format!("encode frame to {}", path.display()))?;
            }
            // Undecodable frame: keep the captured bytes as-is.
            None => std::fs::write(path, &frame.raw)
                .with_context(|| format!("write raw frame to {}", path.display()))?,
        }
        Ok(())
    }
}

impl FrameSink for DiskMqttSink {
    fn start_session(&mut self, device_id: &str) -> Result<SessionInfo> {
        let session = SessionInfo {
            device_id: device_id.to_string(),
            started_at_ms: now_millis(),
        };
        let dir = self.session_dir(&session);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create session directory {}", dir.display()))?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn end_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if let Some(publisher) = &self.publisher {
            let topic = format!("end-stream/{}", session.device_id);
            let payload = self.session_dir(&session).display().to_string();
            publisher.publish(&topic, payload.into_bytes())?;
        }
        Ok(())
    }

    fn receive_frame(&mut self, frame: Frame) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("no active capture session"))?
            .clone();
        let path = self.frame_path(&session, frame.timestamp_ms);
        log::debug!("writing frame {} to {}", frame.timestamp_ms, path.display());
        Self::write_frame(&path, &frame)?;

        if let Some(publisher) = &self.publisher {
            let msg = FrameMsg {
                device_id: session.device_id.clone(),
                file_name: path.display().to_string(),
                timestamp: frame.timestamp_ms,
            };
            let payload = serde_json::to_vec(&msg)?;
            let topic = format!("image/{}", session.device_id);
            // A dropped notification is not worth losing the stream over.
            if let Err(e) = publisher.publish(&topic, payload) {
                log::warn!("error publishing frame notification: {:#}", e);
            }
        }
        Ok(())
    }
}

pub struct DiskMqttSinkProvider {
    video_dir: PathBuf,
    publisher: Option<MqttPublisher>,
}

impl DiskMqttSinkProvider {
    pub fn new(video_dir: impl Into<PathBuf>, publisher: Option<MqttPublisher>) -> Self {
        Self {
            video_dir: video_dir.into(),
            publisher,
        }
    }
}

impl SinkProvider for DiskMqttSinkProvider {
    fn sink_for(&self, _device: &DeviceRecord) -> SharedSink {
        Arc::new(Mutex::new(DiskMqttSink::new(
            self.video_dir.clone(),
            self.publisher.clone(),
        )))
    }
}

// -------------------- Recording sink --------------------

#[derive(Default)]
struct CollectingState {
    active: Option<SessionInfo>,
    sessions_started: u32,
    sessions_ended: u32,
    timestamps: Vec<i64>,
    fail_start: bool,
    fail_receive: bool,
    receive_delay: Option<std::time::Duration>,
}

/// In-memory sink that records everything it sees. Clones share state, so a
/// test can hand one clone to the pipeline and inspect the other afterwards.
#[derive(Clone, Default)]
pub struct CollectingSink {
    state: Arc<Mutex<CollectingState>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start() -> Self {
        let sink = Self::new();
        sink.lock_state().fail_start = true;
        sink
    }

    pub fn failing_receive() -> Self {
        let sink = Self::new();
        sink.lock_state().fail_receive = true;
        sink
    }

    pub fn with_receive_delay(self, delay: std::time::Duration) -> Self {
        self.lock_state().receive_delay = Some(delay);
        self
    }

    pub fn sessions_started(&self) -> u32 {
        self.lock_state().sessions_started
    }

    pub fn sessions_ended(&self) -> u32 {
        self.lock_state().sessions_ended
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().active.is_some()
    }

    pub fn frame_timestamps(&self) -> Vec<i64> {
        self.lock_state().timestamps.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CollectingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for CollectingSink {
    fn start_session(&mut self, device_id: &str) -> Result<SessionInfo> {
        let mut state = self.lock_state();
        if state.fail_start {
            return Err(anyhow!("sink refused to start a session"));
        }
        let session = SessionInfo {
            device_id: device_id.to_string(),
            started_at_ms: now_millis(),
        };
        state.active = Some(session.clone());
        state.sessions_started += 1;
        Ok(session)
    }

    fn end_session(&mut self) -> Result<()> {
        let mut state = self.lock_state();
        if state.active.take().is_some() {
            state.sessions_ended += 1;
        }
        Ok(())
    }

    fn receive_frame(&mut self, frame: Frame) -> Result<()> {
        let delay = {
            let state = self.lock_state();
            state.receive_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.lock_state();
        if state.fail_receive {
            return Err(anyhow!("sink refused frame"));
        }
        if state.active.is_none() {
            return Err(anyhow!("no active capture session"));
        }
        state.timestamps.push(frame.timestamp_ms);
        Ok(())
    }
}

impl SinkProvider for CollectingSink {
    fn sink_for(&self, _device: &DeviceRecord) -> SharedSink {
        Arc::new(Mutex::new(self.clone()))
    }
}
