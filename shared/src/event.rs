use std::time::Duration;
use tokio::sync::oneshot;

use crate::capabilities::{DeliveryOutcome, NotifyError, RecordingError};
use crate::model::{Coordinate, EmergencyId, EmergencyKind, EmergencyRecord, Notes};
use crate::EngineError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Everything that can reach the engine actor, in one mailbox.
///
/// User commands carry a reply channel. Completion events come from spawned
/// location, notification, recording and timer tasks and are tagged with the episode (or
/// timer epoch) they belong to, so late arrivals can be recognised as stale.
#[derive(Debug)]
pub(crate) enum Event {
    // User commands
    Activate {
        kind: EmergencyKind,
        planned: Option<Duration>,
        reply: Reply<EmergencyRecord>,
    },
    Deactivate {
        reply: Reply<Option<EmergencyRecord>>,
    },
    ClearHistory {
        reply: Reply<()>,
    },
    SetNotes {
        id: EmergencyId,
        notes: Option<Notes>,
        reply: Reply<EmergencyRecord>,
    },
    Shutdown {
        reply: Reply<()>,
    },

    // Capability completions
    LocationResolved {
        emergency_id: EmergencyId,
        location: Option<Coordinate>,
    },
    Delivery {
        emergency_id: EmergencyId,
        outcome: DeliveryOutcome,
    },
    DispatchFailed {
        emergency_id: EmergencyId,
        error: NotifyError,
    },
    RecordingStarted {
        emergency_id: EmergencyId,
        result: Result<(), RecordingError>,
    },

    // Timer
    SafetyTimerExpired {
        epoch: u64,
    },
}

impl Event {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::Deactivate { .. } => "deactivate",
            Self::ClearHistory { .. } => "clear_history",
            Self::SetNotes { .. } => "set_notes",
            Self::Shutdown { .. } => "shutdown",
            Self::LocationResolved { .. } => "location_resolved",
            Self::Delivery { .. } => "delivery",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::RecordingStarted { .. } => "recording_started",
            Self::SafetyTimerExpired { .. } => "safety_timer_expired",
        }
    }
}
