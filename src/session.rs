//! Capture session pipeline.
//!
//! One session runs one device capture end to end as three stages on scoped
//! threads: ingest pulls frames off the device, relay moves them between the
//! two bounded queues, and delivery hands each frame to the sink. The queues
//! are the only coupling between stages, so shutdown cascades by channel
//! closure: when ingest returns its sender drops, relay drains and drops its
//! own sender, and delivery finishes whatever is left. Stop is symmetric with
//! start and safe to invoke on any path, including before a successful start.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::directory::DeviceRecord;
use crate::frame::Frame;
use crate::now_millis;
use crate::sink::SharedSink;
use crate::stream::{send_cancellable, StreamSource};

/// Capacity of each inter-stage queue. Deep enough to ride out a slow sink
/// for a couple of seconds of frames without stalling ingest.
pub const CHANNEL_CAPACITY: usize = 64;

pub struct CaptureSession {
    device: DeviceRecord,
    source: Box<dyn StreamSource>,
    sink: SharedSink,
    connecting: bool,
    capturing: bool,
    started_at_ms: Option<i64>,
    stopped_at_ms: Option<i64>,
}

impl CaptureSession {
    pub fn new(device: DeviceRecord, source: Box<dyn StreamSource>, sink: SharedSink) -> Self {
        Self {
            device,
            source,
            sink,
            connecting: false,
            capturing: false,
            started_at_ms: None,
            stopped_at_ms: None,
        }
    }

    /// Run the capture until the token is cancelled or the stream ends.
    /// Teardown is unconditional: every return path, including the error
    /// ones, passes through `stop`.
    pub fn start(&mut self, token: &CancelToken) -> Result<()> {
        {
            let mut sink = self
                .sink
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Err(e) = sink.start_session(&self.device.id) {
                drop(sink);
                self.stop();
                return Err(e).with_context(|| {
                    format!("start sink session for device {}", self.device.id)
                });
            }
        }
        self.connecting = true;
        self.started_at_ms = Some(now_millis());

        if let Err(e) = self.source.connect() {
            self.stop();
            return Err(e).with_context(|| format!("connect to device {}", self.device.id));
        }
        self.capturing = true;
        log::info!("capture started for device {}", self.device.id);

        let (frame_tx, frame_rx) = mpsc::sync_channel::<Frame>(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::sync_channel::<Frame>(CHANNEL_CAPACITY);

        let source = &mut self.source;
        let sink = &self.sink;
        let device_id = self.device.id.clone();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                if let Err(e) = source.stream(token, frame_tx) {
                    log::warn!("stream for device {} ended: {:#}", device_id, e);
                }
            });
            scope.spawn(move || relay_stage(token, frame_rx, out_tx));
            scope.spawn(move || delivery_stage(token, out_rx, sink));
        });

        self.stop();
        Ok(())
    }

    /// Tear the session down. Idempotent: a second call finds the flags
    /// already cleared and leaves the stop timestamp untouched.
    pub fn stop(&mut self) {
        match self.sink.lock() {
            Ok(mut sink) => {
                if let Err(e) = sink.end_session() {
                    log::warn!("error ending sink session for {}: {:#}", self.device.id, e);
                }
            }
            Err(poisoned) => {
                log::warn!("sink lock poisoned while stopping {}", self.device.id);
                if let Err(e) = poisoned.into_inner().end_session() {
                    log::warn!("error ending sink session for {}: {:#}", self.device.id, e);
                }
            }
        }
        if !self.connecting {
            return;
        }
        self.connecting = false;
        self.capturing = false;
        self.stopped_at_ms = Some(now_millis());
        log::info!("capture stopped for device {}", self.device.id);
    }

    pub fn is_connected(&self) -> bool {
        self.connecting
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn started_at_ms(&self) -> Option<i64> {
        self.started_at_ms
    }

    pub fn stopped_at_ms(&self) -> Option<i64> {
        self.stopped_at_ms
    }
}

/// Move frames from the ingest queue to the delivery queue, preserving
/// order. Exits when the upstream sender closes or the token fires.
fn relay_stage(token: &CancelToken, frames: Receiver<Frame>, out: SyncSender<Frame>) {
    loop {
        if token.is_cancelled() {
            return;
        }
        let frame = match frames.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if !send_cancellable(token, &out, frame) {
            return;
        }
    }
}

/// Hand each frame to the sink. A sink failure ends delivery; the rest of
/// the pipeline winds down through cancellation or channel closure.
fn delivery_stage(token: &CancelToken, frames: Receiver<Frame>, sink: &SharedSink) {
    loop {
        if token.is_cancelled() {
            return;
        }
        let frame = match frames.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let timestamp = frame.timestamp_ms;
        let mut sink = sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = sink.receive_frame(frame) {
            log::warn!("sink rejected frame {}: {:#}", timestamp, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CollectingSink, FrameSink};
    use crate::stream::StubSource;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn device() -> DeviceRecord {
        DeviceRecord {
            id: "mockdevice".to_string(),
            name: "Mock Device".to_string(),
            url: "http://localhost:8080".to_string(),
        }
    }

    fn shared(sink: &CollectingSink) -> SharedSink {
        Arc::new(Mutex::new(sink.clone()))
    }

    #[test]
    fn delivers_frames_in_order_and_ends_once() {
        let sink = CollectingSink::new();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([100, 200, 300])),
            shared(&sink),
        );

        session.start(&CancelToken::new()).expect("start");

        assert_eq!(sink.frame_timestamps(), vec![100, 200, 300]);
        assert_eq!(sink.sessions_started(), 1);
        assert_eq!(sink.sessions_ended(), 1);
        assert!(!session.is_connected());
        assert!(!session.is_capturing());
        assert!(session.started_at_ms().is_some());
        assert!(session.stopped_at_ms().is_some());
    }

    #[test]
    fn connect_failure_still_ends_sink_session() {
        let sink = CollectingSink::new();
        let mut session =
            CaptureSession::new(device(), Box::new(StubSource::failing_connect()), shared(&sink));

        let err = session.start(&CancelToken::new()).expect_err("must fail");
        assert!(err.to_string().contains("mockdevice"));

        assert_eq!(sink.sessions_started(), 1);
        assert_eq!(sink.sessions_ended(), 1);
        assert!(sink.frame_timestamps().is_empty());
        assert!(!session.is_connected());
    }

    #[test]
    fn sink_start_failure_aborts_before_connect() {
        let sink = CollectingSink::failing_start();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([1])),
            shared(&sink),
        );

        assert!(session.start(&CancelToken::new()).is_err());
        assert_eq!(sink.sessions_started(), 0);
        assert_eq!(sink.sessions_ended(), 0);
        assert!(sink.frame_timestamps().is_empty());
        assert!(session.started_at_ms().is_none());
    }

    #[test]
    fn cancellation_unblocks_an_open_stream() {
        let sink = CollectingSink::new();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::holding_open([1, 2])),
            shared(&sink),
        );

        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let begun = Instant::now();
        session.start(&token).expect("start");
        handle.join().expect("cancel thread");

        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(sink.sessions_ended(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let sink = CollectingSink::new();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([7])),
            shared(&sink),
        );
        session.start(&CancelToken::new()).expect("start");

        let stopped_at = session.stopped_at_ms();
        session.stop();
        session.stop();

        assert_eq!(session.stopped_at_ms(), stopped_at);
        assert_eq!(sink.sessions_ended(), 1);
    }

    #[test]
    fn stop_before_start_is_safe() {
        let sink = CollectingSink::new();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([])),
            shared(&sink),
        );
        session.stop();
        assert!(session.stopped_at_ms().is_none());
        assert_eq!(sink.sessions_ended(), 0);
    }

    #[test]
    fn sink_failure_stops_delivery_without_wedging() {
        let sink = CollectingSink::failing_receive();
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([1, 2, 3])),
            shared(&sink),
        );

        // Delivery bails on the first rejected frame; ingest finishes its
        // short script and the pipeline unwinds through channel closure.
        session.start(&CancelToken::new()).expect("start");
        assert!(sink.frame_timestamps().is_empty());
        assert_eq!(sink.sessions_ended(), 1);
    }

    #[test]
    fn slow_sink_does_not_drop_frames() {
        let sink = CollectingSink::new().with_receive_delay(Duration::from_millis(10));
        let mut session = CaptureSession::new(
            device(),
            Box::new(StubSource::with_frames([1, 2, 3, 4, 5])),
            shared(&sink),
        );

        session.start(&CancelToken::new()).expect("start");
        assert_eq!(sink.frame_timestamps(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn collecting_sink_shared_state_visible_through_clones() {
        let sink = CollectingSink::new();
        let mut clone = sink.clone();
        clone.start_session("mockdevice").expect("start");
        assert!(sink.is_active());
    }
}
