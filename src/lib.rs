//! Device capture service.
//!
//! This crate captures MJPEG streams from camera devices on demand. An MQTT
//! message names a device; the coordinator looks it up, connects to its HTTP
//! stream, and runs a three-stage pipeline (ingest, relay, delivery) that
//! writes each frame to disk and announces it back on the bus.
//!
//! # Module Structure
//!
//! - `bus`: MQTT trigger dispatch and publishing
//! - `cancel`: cooperative cancellation tokens
//! - `config`: daemon configuration (file + environment)
//! - `coordinator`: single-flight capture admission per device
//! - `directory`: device registry (SQLite and in-memory)
//! - `frame`: captured frame value type
//! - `session`: the three-stage capture pipeline
//! - `sink`: frame destinations (disk + MQTT notifications)
//! - `stream`: HTTP MJPEG stream sources

use std::time::{SystemTime, UNIX_EPOCH};

pub mod bus;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod frame;
pub mod session;
pub mod sink;
pub mod stream;

pub use bus::{BusMessage, MqttBus, MqttPublisher, MqttSettings, StartStreamMessage, START_TOPICS};
pub use cancel::{CancelToken, POLL_INTERVAL};
pub use config::{CapdConfig, DeviceSeed};
pub use coordinator::{CaptureCoordinator, StartStreamError};
pub use directory::{DeviceDirectory, DeviceRecord, MemoryDirectory, SqliteDirectory};
pub use frame::Frame;
pub use session::{CaptureSession, CHANNEL_CAPACITY};
pub use sink::{
    CollectingSink, DiskMqttSink, DiskMqttSinkProvider, FrameMsg, FrameSink, SessionInfo,
    SharedSink, SinkProvider,
};
pub use stream::{
    HttpSourceProvider, HttpStreamSource, SourceProvider, StreamSettings, StreamSource,
    StubSource, DECODE_BACKOFF,
};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
