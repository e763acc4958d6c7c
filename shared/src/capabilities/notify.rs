use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::PermissionState;
use crate::event::Event;
use crate::model::{ContactId, EmergencyId, EmergencySnapshot};

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification permission denied")]
    PermissionDenied,

    #[error("no trusted contacts configured")]
    NoContacts,

    #[error("contact unreachable: {reason}")]
    Unreachable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(ContactId),
    Failed { contact: ContactId, error: NotifyError },
}

/// Per-contact result channel handed to the dispatcher for one episode.
///
/// Each report re-enters the engine mailbox, so confirmations may arrive long
/// after activation returned, or after the episode ended. The reporter does
/// not keep the engine alive; once it is gone reports are dropped.
#[derive(Debug, Clone)]
pub struct DeliveryReporter {
    emergency_id: EmergencyId,
    sink: mpsc::WeakSender<Event>,
}

impl DeliveryReporter {
    pub(crate) fn new(emergency_id: EmergencyId, sink: mpsc::WeakSender<Event>) -> Self {
        Self { emergency_id, sink }
    }

    #[must_use]
    pub fn emergency_id(&self) -> &EmergencyId {
        &self.emergency_id
    }

    pub async fn delivered(&self, contact: ContactId) {
        self.report(DeliveryOutcome::Delivered(contact)).await;
    }

    pub async fn failed(&self, contact: ContactId, error: NotifyError) {
        self.report(DeliveryOutcome::Failed { contact, error }).await;
    }

    async fn report(&self, outcome: DeliveryOutcome) {
        let event = Event::Delivery {
            emergency_id: self.emergency_id.clone(),
            outcome,
        };
        let delivered = match self.sink.upgrade() {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        };
        if !delivered {
            debug!(emergency_id = %self.emergency_id, "engine gone, delivery report dropped");
        }
    }
}

#[async_trait::async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Notifies trusted contacts about `snapshot`, reporting each contact
    /// through `reporter`. An `Err` means nobody could be attempted.
    async fn notify(
        &self,
        snapshot: EmergencySnapshot,
        reporter: DeliveryReporter,
    ) -> Result<(), NotifyError>;
}

/// Dispatcher over a fixed contact list.
///
/// Contacts in the failing set are reported as unreachable. An optional
/// per-contact delay models slow delivery.
#[derive(Debug)]
pub struct ContactListDispatcher {
    contacts: Vec<ContactId>,
    failing: Mutex<HashSet<ContactId>>,
    permission: Mutex<PermissionState>,
    delivery_delay: Option<Duration>,
    received: Mutex<Vec<EmergencySnapshot>>,
}

impl ContactListDispatcher {
    #[must_use]
    pub fn new(contacts: Vec<ContactId>) -> Self {
        Self {
            contacts,
            failing: Mutex::new(HashSet::new()),
            permission: Mutex::new(PermissionState::Authorized),
            delivery_delay: None,
            received: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = Some(delay);
        self
    }

    pub fn fail_for(&self, contact: ContactId) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(contact);
        }
    }

    pub fn set_permission(&self, permission: PermissionState) {
        if let Ok(mut guard) = self.permission.lock() {
            *guard = permission;
        }
    }

    /// Every snapshot this dispatcher was asked to send, oldest first.
    pub fn received(&self) -> Vec<EmergencySnapshot> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn is_failing(&self, contact: &ContactId) -> bool {
        self.failing
            .lock()
            .map(|failing| failing.contains(contact))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl NotificationDispatcher for ContactListDispatcher {
    async fn notify(
        &self,
        snapshot: EmergencySnapshot,
        reporter: DeliveryReporter,
    ) -> Result<(), NotifyError> {
        let authorized = self
            .permission
            .lock()
            .map(|p| p.is_authorized())
            .unwrap_or(false);
        if !authorized {
            return Err(NotifyError::PermissionDenied);
        }
        if self.contacts.is_empty() {
            return Err(NotifyError::NoContacts);
        }
        if let Ok(mut received) = self.received.lock() {
            received.push(snapshot);
        }

        for contact in &self.contacts {
            if let Some(delay) = self.delivery_delay {
                tokio::time::sleep(delay).await;
            }
            if self.is_failing(contact) {
                reporter
                    .failed(
                        contact.clone(),
                        NotifyError::Unreachable {
                            reason: "delivery rejected".into(),
                        },
                    )
                    .await;
            } else {
                reporter.delivered(contact.clone()).await;
            }
        }
        Ok(())
    }
}
