//! Device stream sources.
//!
//! A stream source owns the network connection to one camera device and
//! pushes decoded frames into the pipeline's ingest queue. The HTTP source
//! speaks MJPEG (`multipart/x-mixed-replace`) and falls back to polling the
//! stream endpoint for single JPEG snapshots when the device does not
//! multipart. Transient read and decode failures never abort a capture; the
//! source backs off briefly and keeps going until cancelled.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::Duration;
use url::Url;

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::directory::DeviceRecord;
use crate::frame::Frame;

/// Ceiling on a single frame; a boundary never seen within this much data
/// means the stream is garbage, not a picture.
const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Pause after a failed read or fetch before trying again.
pub const DECODE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub decode_backoff: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            decode_backoff: DECODE_BACKOFF,
        }
    }
}

/// Producer side of a capture pipeline.
///
/// `connect` establishes the device connection; `stream` then pushes frames
/// into `out` until the token is cancelled or the peer goes away for good.
/// `stream` returning `Ok` after cancellation is the normal shutdown path.
pub trait StreamSource: Send {
    fn connect(&mut self) -> Result<()>;
    fn stream(&mut self, token: &CancelToken, out: SyncSender<Frame>) -> Result<()>;
}

/// Builds one source per device for the coordinator.
pub trait SourceProvider: Send + Sync {
    fn source_for(&self, device: &DeviceRecord) -> Box<dyn StreamSource>;
}

pub struct HttpSourceProvider {
    settings: StreamSettings,
}

impl HttpSourceProvider {
    pub fn new(settings: StreamSettings) -> Self {
        Self { settings }
    }
}

impl SourceProvider for HttpSourceProvider {
    fn source_for(&self, device: &DeviceRecord) -> Box<dyn StreamSource> {
        Box::new(HttpStreamSource::new(&device.url, self.settings.clone()))
    }
}

enum HttpStream {
    Mjpeg(MjpegStream),
    /// Device answered with a plain JPEG; poll the endpoint per frame.
    Snapshot,
}

/// MJPEG-over-HTTP stream source.
pub struct HttpStreamSource {
    base_url: String,
    stream_url: String,
    settings: StreamSettings,
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
    connection: Option<HttpStream>,
}

impl HttpStreamSource {
    pub fn new(base_url: &str, settings: StreamSettings) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        // The long-lived stream read uses a socket timeout of one poll
        // interval, so a silent connection surfaces a timed-out read at the
        // cancellation cadence instead of parking in read().
        let stream_agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(POLL_INTERVAL)
            .build();
        Self {
            stream_url: format!("{}/stream", base_url),
            base_url,
            settings,
            agent,
            stream_agent,
            connection: None,
        }
    }

    /// Liveness probe against the device's `/ping` endpoint.
    pub fn ping(&self) -> bool {
        let url = format!("{}/ping", self.base_url);
        match self.agent.get(&url).call() {
            Ok(resp) => resp.status() == 200,
            Err(e) => {
                log::debug!("ping {} failed: {}", url, e);
                false
            }
        }
    }

    fn open_stream(&self) -> Result<HttpStream> {
        let response = self
            .stream_agent
            .get(&self.stream_url)
            .set("Accept", "multipart/x-mixed-replace, image/jpeg")
            .set("User-Agent", "capd")
            .call()
            .with_context(|| format!("connect to device stream {}", self.stream_url))?;

        let content_type = response.content_type().to_string();
        if content_type.starts_with("multipart/") {
            let reader: Box<dyn Read + Send> = Box::new(response.into_reader());
            Ok(HttpStream::Mjpeg(MjpegStream::new(reader)))
        } else {
            log::info!(
                "device at {} serves {} snapshots instead of multipart",
                self.stream_url,
                content_type
            );
            Ok(HttpStream::Snapshot)
        }
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.stream_url)
            .call()
            .with_context(|| format!("fetch snapshot from {}", self.stream_url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.len() > MAX_JPEG_BYTES {
            bail!("snapshot larger than {} bytes", MAX_JPEG_BYTES);
        }
        Ok(bytes)
    }
}

impl StreamSource for HttpStreamSource {
    fn connect(&mut self) -> Result<()> {
        let parsed = Url::parse(&self.base_url)
            .with_context(|| format!("invalid device url {}", self.base_url))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("unsupported device url scheme {}", parsed.scheme());
        }
        self.connection = Some(self.open_stream()?);
        log::info!("connected to device stream {}", self.stream_url);
        Ok(())
    }

    fn stream(&mut self, token: &CancelToken, out: SyncSender<Frame>) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            let connection = self
                .connection
                .as_mut()
                .ok_or_else(|| anyhow!("stream source not connected"))?;
            let raw = match connection {
                HttpStream::Mjpeg(stream) => match stream.read_next_jpeg(token) {
                    Ok(Some(raw)) => Ok(raw),
                    Ok(None) => return Ok(()),
                    Err(e) => Err(e),
                },
                HttpStream::Snapshot => self.fetch_snapshot(),
            };
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("error reading frame from {}: {:#}", self.stream_url, e);
                    if !token.sleep(self.settings.decode_backoff) {
                        return Ok(());
                    }
                    continue;
                }
            };
            if !send_cancellable(token, &out, Frame::from_jpeg(raw)) {
                return Ok(());
            }
        }
    }
}

/// Incremental parser over a `multipart/x-mixed-replace` body.
///
/// Rather than parsing part headers, frames are carved out by their JPEG
/// markers: everything between an SOI (`FF D8`) and the next EOI (`FF D9`)
/// is one frame, and boundary chatter in between is discarded.
struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK_BYTES),
        }
    }

    /// Pull bytes until one complete JPEG is buffered. `Ok(None)` means the
    /// token fired while the connection was silent; errors are transient
    /// stream faults for the caller to back off on.
    fn read_next_jpeg(&mut self, token: &CancelToken) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }
            if self.buffer.len() > MAX_JPEG_BYTES {
                // Keep the tail in case a marker straddles the cut.
                let keep_from = self.buffer.len() - 2;
                self.buffer.drain(..keep_from);
                bail!("no frame boundary within {} bytes", MAX_JPEG_BYTES);
            }
            match self.reader.read(&mut chunk) {
                Ok(0) => bail!("mjpeg stream ended"),
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                // Socket read timeout: the poll point for a silent peer.
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if token.is_cancelled() {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e).context("read mjpeg stream"),
            }
        }
    }
}

/// Locate one complete JPEG in `data`: byte range from the first SOI marker
/// to just past the first EOI marker that follows it.
fn find_jpeg_bounds(data: &[u8]) -> Option<(usize, usize)> {
    let start = data.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = data[start..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .map(|pos| start + pos + 2)?;
    Some((start, end))
}

/// Push a frame into a bounded queue without blocking past cancellation.
/// Returns `false` once the token is cancelled or the receiver is gone.
pub(crate) fn send_cancellable(
    token: &CancelToken,
    tx: &SyncSender<Frame>,
    frame: Frame,
) -> bool {
    let mut frame = frame;
    loop {
        if token.is_cancelled() {
            return false;
        }
        match tx.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                frame = back;
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

// -------------------- Scripted source --------------------

/// Scripted source used by pipeline and coordinator tests. Emits one frame
/// per configured timestamp, then either returns or holds the stream open
/// until cancelled.
#[derive(Default)]
pub struct StubSource {
    frames: Vec<i64>,
    fail_connect: bool,
    hold_open: bool,
    frame_gap: Option<Duration>,
    connected: bool,
}

impl StubSource {
    pub fn with_frames(frames: impl Into<Vec<i64>>) -> Self {
        Self {
            frames: frames.into(),
            ..Self::default()
        }
    }

    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    pub fn holding_open(frames: impl Into<Vec<i64>>) -> Self {
        Self {
            frames: frames.into(),
            hold_open: true,
            ..Self::default()
        }
    }

    pub fn with_frame_gap(mut self, gap: Duration) -> Self {
        self.frame_gap = Some(gap);
        self
    }
}

impl StreamSource for StubSource {
    fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            bail!("device refused connection");
        }
        self.connected = true;
        Ok(())
    }

    fn stream(&mut self, token: &CancelToken, out: SyncSender<Frame>) -> Result<()> {
        if !self.connected {
            bail!("stream source not connected");
        }
        for &timestamp_ms in &self.frames {
            if token.is_cancelled() {
                return Ok(());
            }
            if let Some(gap) = self.frame_gap {
                if !token.sleep(gap) {
                    return Ok(());
                }
            }
            let frame = Frame {
                raw: vec![0xFF, 0xD8, 0xFF, 0xD9],
                image: None,
                timestamp_ms,
            };
            if !send_cancellable(token, &out, frame) {
                return Ok(());
            }
        }
        if self.hold_open {
            while !token.is_cancelled() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        Ok(())
    }
}
