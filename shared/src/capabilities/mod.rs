mod location;
mod media;
mod notify;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use self::location::{FixedLocationProvider, LocationProvider};
pub use self::media::{CaptureSummary, InMemoryRecorder, MediaRecorder, RecordingError};
pub use self::notify::{
    ContactListDispatcher, DeliveryOutcome, DeliveryReporter, NotificationDispatcher, NotifyError,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Denied,
    Authorized,
    Provisional,
}

impl PermissionState {
    #[must_use]
    pub const fn is_authorized(self) -> bool {
        matches!(self, Self::Authorized | Self::Provisional)
    }
}

/// The collaborators the engine drives, injected by the host shell.
#[derive(Clone)]
pub struct Capabilities {
    pub location: Arc<dyn LocationProvider>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    pub recorder: Arc<dyn MediaRecorder>,
}

impl Capabilities {
    pub fn new(
        location: Arc<dyn LocationProvider>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        recorder: Arc<dyn MediaRecorder>,
    ) -> Self {
        Self {
            location,
            dispatcher,
            recorder,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
