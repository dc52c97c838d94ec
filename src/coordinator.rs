//! Capture coordinator.
//!
//! The coordinator owns the single-flight guard: at most one capture per
//! device at a time, enforced by an active-device set checked and updated
//! under one mutex acquisition. Admission (conflict check, directory lookup,
//! reservation) happens under the lock; the capture itself runs outside it,
//! so concurrent captures for different devices never serialize on each
//! other.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cancel::CancelToken;
use crate::directory::DeviceDirectory;
use crate::session::CaptureSession;
use crate::sink::SinkProvider;
use crate::stream::SourceProvider;

/// Why a start request was not (or could not be) served.
#[derive(Debug)]
pub enum StartStreamError {
    /// A capture for this device is already running; stream multiplexing is
    /// not supported, so the request is rejected outright.
    Conflict { device_id: String },
    /// The device is not registered in the directory.
    NotFound { device_id: String },
    /// The capture was admitted but failed while running.
    Session(anyhow::Error),
}

impl fmt::Display for StartStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartStreamError::Conflict { device_id } => write!(
                f,
                "capture already active for device {}; stream multiplexing is not supported",
                device_id
            ),
            StartStreamError::NotFound { device_id } => {
                write!(f, "device {} not found", device_id)
            }
            StartStreamError::Session(e) => write!(f, "capture session failed: {:#}", e),
        }
    }
}

impl std::error::Error for StartStreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartStreamError::Session(e) => {
                let source: &(dyn std::error::Error + 'static) = e.as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

pub struct CaptureCoordinator {
    directory: Arc<dyn DeviceDirectory>,
    sinks: Arc<dyn SinkProvider>,
    sources: Arc<dyn SourceProvider>,
    active: Mutex<HashSet<String>>,
}

impl CaptureCoordinator {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        sinks: Arc<dyn SinkProvider>,
        sources: Arc<dyn SourceProvider>,
    ) -> Self {
        Self {
            directory,
            sinks,
            sources,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Run a capture for `device_id` to completion.
    ///
    /// Admission happens atomically: the conflict check, directory lookup,
    /// and reservation all occur under one lock acquisition, so two
    /// simultaneous requests for the same device cannot both pass. The
    /// reservation is released on every exit path once the capture ends.
    pub fn start_stream(
        &self,
        token: &CancelToken,
        device_id: &str,
    ) -> Result<(), StartStreamError> {
        let device = {
            let mut active = self.lock_active();
            if active.contains(device_id) {
                return Err(StartStreamError::Conflict {
                    device_id: device_id.to_string(),
                });
            }
            let device = self
                .directory
                .get_device(device_id)
                .map_err(StartStreamError::Session)?
                .ok_or_else(|| StartStreamError::NotFound {
                    device_id: device_id.to_string(),
                })?;
            active.insert(device_id.to_string());
            device
        };
        let _guard = ActiveGuard {
            active: &self.active,
            device_id,
        };

        let sink = self.sinks.sink_for(&device);
        let source = self.sources.source_for(&device);
        let mut session = CaptureSession::new(device, source, sink);
        session.start(token).map_err(StartStreamError::Session)
    }

    /// Devices with a capture currently running.
    pub fn active_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.lock_active().iter().cloned().collect();
        devices.sort();
        devices
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the active-set reservation when the capture ends, on success,
/// error, and panic alike.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    device_id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.device_id);
    }
}
