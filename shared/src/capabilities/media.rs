use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use super::PermissionState;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordingError {
    #[error("recording permission denied")]
    PermissionDenied,

    #[error("recording device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("recorder is not capturing")]
    NotRecording,

    #[error("recorder did not respond in time")]
    Timeout,

    #[error("recording failed: {message}")]
    Failed { message: String },
}

impl RecordingError {
    #[must_use]
    pub const fn is_permission_problem(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

/// Confirmation returned when capture stops.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureSummary {
    pub captured: bool,
    pub duration_ms: u64,
}

#[async_trait::async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Begins audio+video capture. Returns once capture has been requested.
    async fn start_capture(&self) -> Result<(), RecordingError>;

    /// Stops capture and initiates file finalization.
    async fn stop_capture(&self) -> Result<CaptureSummary, RecordingError>;

    fn is_recording(&self) -> bool;
}

/// Recorder that tracks capture state without touching any device.
///
/// Used by hosts without media support and by tests; call counters and the
/// failure switch make partial failure observable.
#[derive(Debug)]
pub struct InMemoryRecorder {
    permission: Mutex<PermissionState>,
    started_at: Mutex<Option<Instant>>,
    fail_start: AtomicBool,
    recording: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl InMemoryRecorder {
    #[must_use]
    pub fn new(permission: PermissionState) -> Self {
        Self {
            permission: Mutex::new(permission),
            started_at: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn authorized() -> Self {
        Self::new(PermissionState::Authorized)
    }

    pub fn set_permission(&self, permission: PermissionState) {
        if let Ok(mut guard) = self.permission.lock() {
            *guard = permission;
        }
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn permission(&self) -> PermissionState {
        self.permission
            .lock()
            .map(|guard| *guard)
            .unwrap_or(PermissionState::Denied)
    }
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::authorized()
    }
}

#[async_trait::async_trait]
impl MediaRecorder for InMemoryRecorder {
    async fn start_capture(&self) -> Result<(), RecordingError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        if !self.permission().is_authorized() {
            return Err(RecordingError::PermissionDenied);
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RecordingError::DeviceUnavailable {
                reason: "injected failure".into(),
            });
        }

        let mut started_at = self.started_at.lock().map_err(|_| RecordingError::Failed {
            message: "recorder state poisoned".into(),
        })?;
        if started_at.is_none() {
            *started_at = Some(Instant::now());
        }
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<CaptureSummary, RecordingError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);

        let started = self
            .started_at
            .lock()
            .map_err(|_| RecordingError::Failed {
                message: "recorder state poisoned".into(),
            })?
            .take();
        self.recording.store(false, Ordering::SeqCst);

        match started {
            Some(at) => Ok(CaptureSummary {
                captured: true,
                duration_ms: u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
            None => Err(RecordingError::NotRecording),
        }
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}
