//! Emergency coordination engine.
//!
//! A single actor task owns the current episode, the safety timer and the
//! history. [`EmergencyEngine`] is a cheap, cloneable handle: commands go
//! through the actor mailbox, reads come from the last published
//! [`EngineSnapshot`].
//!
//! Capability calls that may be slow (location, notification, capture start)
//! run on spawned tasks and report back through the same mailbox, so a
//! deactivation is never stuck behind them. Those tasks hold only a weak
//! mailbox handle: dropping every [`EmergencyEngine`] ends the actor.
//!
//! The safety timer is cancelled logically: each scheduled timer carries an
//! epoch and only an expiry with the pending epoch is acted on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{
    Capabilities, DeliveryOutcome, DeliveryReporter, NotifyError, RecordingError,
};
use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::event::{Event, Reply};
use crate::history::{self, History};
use crate::model::{
    duration_to_ms, Coordinate, EmergencyId, EmergencyKind, EmergencyRecord, Notes, UnixTimeMs,
    ValidationError,
};
use crate::store::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
use crate::EngineError;

/// Published after every serialized mutation.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub current: Option<EmergencyRecord>,
    /// Insertion order; see [`EngineSnapshot::history_newest_first`].
    pub history: Arc<[EmergencyRecord]>,
    pub safety_timer: Option<SafetyTimerStatus>,
    /// The stored history could not be read at start and was replaced by an
    /// empty one.
    pub history_recovered: bool,
}

impl EngineSnapshot {
    fn empty() -> Self {
        Self {
            current: None,
            history: Arc::from(Vec::new()),
            safety_timer: None,
            history_recovered: false,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    #[must_use]
    pub fn history_newest_first(&self) -> Vec<EmergencyRecord> {
        history::newest_first(&self.history)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafetyTimerStatus {
    pub emergency_id: EmergencyId,
    pub deadline: UnixTimeMs,
}

#[derive(Clone)]
pub struct EmergencyEngine {
    tx: mpsc::Sender<Event>,
    state: watch::Receiver<EngineSnapshot>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for EmergencyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyEngine")
            .field("is_active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl EmergencyEngine {
    /// Loads the history from `store` and spawns the actor on the current
    /// tokio runtime.
    ///
    /// An unreadable history never stops the engine from starting: the bad
    /// contents are set aside, the engine starts with an empty history and
    /// `EngineSnapshot::history_recovered` is raised.
    #[instrument(skip_all)]
    pub async fn start(
        config: EngineConfig,
        capabilities: Capabilities,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (mut records, history_recovered) = load_history(store.as_ref()).await;
        let now = clock.now();
        let mut recovered = 0usize;
        for record in records.iter_mut().filter(|r| r.is_active()) {
            // Nothing is driving this episode any more: the process went away
            // while it was active.
            record.finalize(Duration::from_millis(now.elapsed_since(record.started_at())));
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "closed emergencies left active by a previous run");
        }

        let (tx, rx) = mpsc::channel(config.command_queue_capacity);
        let (published, state) = watch::channel(EngineSnapshot::empty());

        let actor = EngineActor {
            config: config.clone(),
            capabilities,
            store,
            clock,
            mailbox: tx.downgrade(),
            history: History::from_records(records),
            current: None,
            timer: None,
            next_epoch: 0,
            history_recovered,
            published,
        };
        actor.publish();
        if recovered > 0 {
            actor.persist().await;
        }

        info!(history_len = actor.history.len(), "emergency engine started");
        tokio::spawn(actor.run(rx));

        Ok(Self {
            tx,
            state,
            config: Arc::new(config),
        })
    }

    /// Starts with a file store when `history_path` is configured, an
    /// in-memory store otherwise, and a [`MonotonicClock`].
    pub async fn with_defaults(
        config: EngineConfig,
        capabilities: Capabilities,
    ) -> Result<Self, EngineError> {
        let store: Arc<dyn HistoryStore> = match &config.history_path {
            Some(path) => Arc::new(FileHistoryStore::new(path.clone())),
            None => Arc::new(MemoryHistoryStore::new()),
        };
        Self::start(config, capabilities, store, Arc::new(MonotonicClock::new())).await
    }

    pub async fn activate_sos(&self) -> Result<EmergencyRecord, EngineError> {
        self.activate(EmergencyKind::Sos, None).await
    }

    pub async fn activate_safety_timer(
        &self,
        duration: Duration,
    ) -> Result<EmergencyRecord, EngineError> {
        self.validate_timer(duration)?;
        self.activate(EmergencyKind::SafetyTimer, Some(duration)).await
    }

    pub async fn activate_manual_emergency(&self) -> Result<EmergencyRecord, EngineError> {
        self.activate(EmergencyKind::Manual, None).await
    }

    /// Returns the finalized record, or `None` if nothing was active.
    pub async fn deactivate_emergency(&self) -> Result<Option<EmergencyRecord>, EngineError> {
        self.request(|reply| Event::Deactivate { reply }).await
    }

    pub async fn clear_history(&self) -> Result<(), EngineError> {
        self.request(|reply| Event::ClearHistory { reply }).await
    }

    pub async fn set_notes(
        &self,
        id: &EmergencyId,
        notes: Option<String>,
    ) -> Result<EmergencyRecord, EngineError> {
        let notes = notes.map(Notes::new).transpose()?;
        let id = id.clone();
        self.request(|reply| Event::SetNotes { id, notes, reply })
            .await
    }

    /// Stops the actor. An active episode stays active in the history and is
    /// closed out on the next start.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Event::Shutdown { reply }).await
    }

    /// All records, most recent first.
    #[must_use]
    pub fn history(&self) -> Vec<EmergencyRecord> {
        self.state.borrow().history_newest_first()
    }

    #[must_use]
    pub fn current_emergency(&self) -> Option<EmergencyRecord> {
        self.state.borrow().current.clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.state.clone()
    }

    fn validate_timer(&self, duration: Duration) -> Result<(), ValidationError> {
        if duration.is_zero() {
            return Err(ValidationError::ZeroDuration);
        }
        let requested_ms = duration_to_ms(duration);
        if requested_ms < self.config.min_safety_timer_ms {
            return Err(ValidationError::DurationTooShort {
                requested_ms,
                min_ms: self.config.min_safety_timer_ms,
            });
        }
        if requested_ms > self.config.max_safety_timer_ms {
            return Err(ValidationError::DurationTooLong {
                requested_ms,
                max_ms: self.config.max_safety_timer_ms,
            });
        }
        Ok(())
    }

    async fn activate(
        &self,
        kind: EmergencyKind,
        planned: Option<Duration>,
    ) -> Result<EmergencyRecord, EngineError> {
        self.request(|reply| Event::Activate {
            kind,
            planned,
            reply,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Event) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)?
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingLocation,
    Dispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Deactivated,
    TimerExpired,
}

struct Episode {
    record: EmergencyRecord,
    phase: Phase,
    history_cleared: bool,
}

struct PendingTimer {
    epoch: u64,
    emergency_id: EmergencyId,
    deadline: UnixTimeMs,
    handle: JoinHandle<()>,
}

struct EngineActor {
    config: EngineConfig,
    capabilities: Capabilities,
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    mailbox: mpsc::WeakSender<Event>,
    history: History,
    current: Option<Episode>,
    timer: Option<PendingTimer>,
    next_epoch: u64,
    history_recovered: bool,
    published: watch::Sender<EngineSnapshot>,
}

impl EngineActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            if let Event::Shutdown { reply } = event {
                self.cancel_timer();
                self.persist().await;
                info!("emergency engine stopped");
                let _ = reply.send(Ok(()));
                return;
            }
            self.handle(event).await;
        }
        self.cancel_timer();
        debug!("all engine handles dropped, actor exiting");
    }

    #[instrument(skip_all, fields(event = event.name()))]
    async fn handle(&mut self, event: Event) {
        match event {
            Event::Activate {
                kind,
                planned,
                reply,
            } => {
                let record = self.activate(kind, planned).await;
                let _ = reply.send(Ok(record));
            }
            Event::Deactivate { reply } => {
                let record = self.deactivate().await;
                let _ = reply.send(Ok(record));
            }
            Event::ClearHistory { reply } => {
                self.clear_history().await;
                let _ = reply.send(Ok(()));
            }
            Event::SetNotes { id, notes, reply } => {
                let result = self.set_notes(id, notes).await;
                let _ = reply.send(result);
            }
            Event::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
            Event::LocationResolved {
                emergency_id,
                location,
            } => self.on_location_resolved(&emergency_id, location).await,
            Event::Delivery {
                emergency_id,
                outcome,
            } => self.on_delivery(&emergency_id, outcome).await,
            Event::DispatchFailed {
                emergency_id,
                error,
            } => on_dispatch_failed(&emergency_id, &error),
            Event::RecordingStarted {
                emergency_id,
                result,
            } => self.on_recording_started(&emergency_id, result),
            Event::SafetyTimerExpired { epoch } => self.on_timer_expired(epoch).await,
        }
    }

    // --- Activation ---

    async fn activate(&mut self, kind: EmergencyKind, planned: Option<Duration>) -> EmergencyRecord {
        if let Some(episode) = &self.current {
            debug!(
                emergency_id = %episode.record.id(),
                requested = %kind,
                "emergency already active, activation ignored"
            );
            return episode.record.clone();
        }

        let record = EmergencyRecord::open(kind, self.clock.now(), planned);
        info!(emergency_id = %record.id(), kind = %kind, "emergency activated");

        self.history.append(record.clone());
        self.current = Some(Episode {
            record: record.clone(),
            phase: Phase::AwaitingLocation,
            history_cleared: false,
        });

        if let (EmergencyKind::SafetyTimer, Some(duration)) = (kind, planned) {
            self.schedule_timer(record.id().clone(), duration);
        }
        self.request_location(record.id().clone());

        self.publish();
        self.persist().await;
        record
    }

    fn request_location(&self, emergency_id: EmergencyId) {
        let mailbox = self.mailbox.clone();
        let provider = Arc::clone(&self.capabilities.location);
        let timeout = self.config.location_timeout();

        tokio::spawn(async move {
            let location = match tokio::time::timeout(timeout, provider.current_location()).await {
                Ok(location) => location,
                Err(_) => {
                    warn!(emergency_id = %emergency_id, "location request timed out");
                    None
                }
            };
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(Event::LocationResolved {
                        emergency_id,
                        location,
                    })
                    .await;
            }
        });
    }

    async fn on_location_resolved(&mut self, id: &EmergencyId, location: Option<Coordinate>) {
        let awaiting = self
            .current
            .as_ref()
            .is_some_and(|ep| ep.record.id() == id && ep.phase == Phase::AwaitingLocation);
        if !awaiting {
            debug!(
                emergency_id = %id,
                "episode no longer awaiting location, skipping dispatch and recording"
            );
            return;
        }

        match location {
            Some(coordinate) => {
                self.update_record(id, |r| r.set_location(coordinate));
            }
            None => warn!(emergency_id = %id, "location unavailable, alerting without it"),
        }

        let Some(episode) = self.current.as_mut() else {
            return;
        };
        episode.phase = Phase::Dispatched;
        let snapshot = episode.record.snapshot();

        self.dispatch(snapshot);
        self.start_recording(id.clone());

        self.publish();
        self.persist().await;
    }

    fn dispatch(&self, snapshot: crate::model::EmergencySnapshot) {
        let mailbox = self.mailbox.clone();
        let dispatcher = Arc::clone(&self.capabilities.dispatcher);

        tokio::spawn(async move {
            let emergency_id = snapshot.id.clone();
            let reporter = DeliveryReporter::new(emergency_id.clone(), mailbox.clone());
            if let Err(error) = dispatcher.notify(snapshot, reporter).await {
                if let Some(tx) = mailbox.upgrade() {
                    let _ = tx
                        .send(Event::DispatchFailed {
                            emergency_id,
                            error,
                        })
                        .await;
                }
            }
        });
    }

    /// Requests capture on a spawned task; the outcome comes back as
    /// `Event::RecordingStarted`.
    fn start_recording(&self, emergency_id: EmergencyId) {
        let mailbox = self.mailbox.clone();
        let recorder = Arc::clone(&self.capabilities.recorder);
        let timeout = self.config.recorder_timeout();

        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, recorder.start_capture())
                .await
                .unwrap_or(Err(RecordingError::Timeout));
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(Event::RecordingStarted {
                        emergency_id,
                        result,
                    })
                    .await;
            }
        });
    }

    fn on_recording_started(&self, id: &EmergencyId, result: Result<(), RecordingError>) {
        if let Err(e) = result {
            warn!(emergency_id = %id, error = %e, "media capture unavailable");
            return;
        }
        match &self.current {
            Some(ep) if ep.record.id() == id => info!(emergency_id = %id, "media capture started"),
            // A newer episode owns the running capture and stops it when it ends.
            Some(_) => debug!(emergency_id = %id, "capture started late, kept for current episode"),
            None => {
                // The episode's stop already ran and found nothing to stop.
                debug!(emergency_id = %id, "capture started after episode ended, stopping it");
                let recorder = Arc::clone(&self.capabilities.recorder);
                let timeout = self.config.recorder_timeout();
                tokio::spawn(async move {
                    let stopped = tokio::time::timeout(timeout, recorder.stop_capture())
                        .await
                        .unwrap_or(Err(RecordingError::Timeout));
                    if let Err(e) = stopped {
                        warn!(error = %e, "could not stop orphaned media capture");
                    }
                });
            }
        }
    }

    async fn on_delivery(&mut self, id: &EmergencyId, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered(contact) => {
                match self.update_record(id, |r| r.push_contact(contact.clone())) {
                    Some(true) => {
                        info!(emergency_id = %id, contact = %contact, "contact notified");
                        self.publish();
                        self.persist().await;
                    }
                    Some(false) => {
                        debug!(emergency_id = %id, contact = %contact, "duplicate delivery report");
                    }
                    None => {
                        debug!(emergency_id = %id, contact = %contact, "delivery for a cleared record");
                    }
                }
            }
            DeliveryOutcome::Failed { contact, error } => {
                warn!(emergency_id = %id, contact = %contact, error = %error, "contact notification failed");
            }
        }
    }

    // --- Deactivation ---

    async fn deactivate(&mut self) -> Option<EmergencyRecord> {
        if self.current.is_none() {
            debug!("no active emergency, deactivation ignored");
            return None;
        }

        self.cancel_timer();
        let record = self.finish_current(Finish::Deactivated).await;

        self.publish();
        self.persist().await;
        record
    }

    /// Stops capture, finalizes the current record and writes it back into
    /// the history. Leaves the engine idle.
    async fn finish_current(&mut self, how: Finish) -> Option<EmergencyRecord> {
        let mut episode = self.current.take()?;
        let id = episode.record.id().clone();

        let recorder = &self.capabilities.recorder;
        let stopped = tokio::time::timeout(self.config.recorder_timeout(), recorder.stop_capture())
            .await
            .unwrap_or(Err(RecordingError::Timeout));
        match stopped {
            Ok(summary) if summary.captured => {
                episode.record.mark_media_recorded();
                debug!(emergency_id = %id, duration_ms = summary.duration_ms, "media capture stopped");
            }
            Ok(_) => debug!(emergency_id = %id, "recorder stopped without media"),
            Err(RecordingError::Timeout) => warn!(emergency_id = %id, "media recorder stop timed out"),
            Err(e) => debug!(emergency_id = %id, error = %e, "recorder stop reported no capture"),
        }

        let measured = Duration::from_millis(self.clock.now().elapsed_since(episode.record.started_at()));
        let elapsed = match how {
            Finish::Deactivated => measured,
            Finish::TimerExpired => episode.record.planned_duration().unwrap_or(measured),
        };
        episode.record.finalize(elapsed);

        let replaced = self.history.replace(&episode.record);
        if !replaced && !episode.history_cleared {
            error!(
                emergency_id = %id,
                "invariant violated: finalized emergency missing from history"
            );
        }
        debug_assert!(
            replaced || episode.history_cleared,
            "finalized emergency {id} missing from history"
        );

        info!(
            emergency_id = %id,
            kind = %episode.record.kind(),
            elapsed_ms = duration_to_ms(elapsed),
            media_recorded = episode.record.media_recorded(),
            contacts = episode.record.notified_contacts().len(),
            reason = ?how,
            "emergency finalized"
        );
        Some(episode.record)
    }

    // --- Safety timer ---

    fn schedule_timer(&mut self, emergency_id: EmergencyId, duration: Duration) {
        self.cancel_timer();
        self.next_epoch += 1;
        let epoch = self.next_epoch;

        let mailbox = self.mailbox.clone();
        // Deadline is fixed here, not when the task is first polled.
        let sleep = tokio::time::sleep(duration);
        let handle = tokio::spawn(async move {
            sleep.await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Event::SafetyTimerExpired { epoch }).await;
            }
        });

        let deadline = self.clock.now().add_millis(duration_to_ms(duration));
        debug!(emergency_id = %emergency_id, epoch, deadline_ms = deadline.0, "safety timer scheduled");
        self.timer = Some(PendingTimer {
            epoch,
            emergency_id,
            deadline,
            handle,
        });
    }

    /// Idempotent. An expiry already sitting in the mailbox is discarded by
    /// the epoch check in `on_timer_expired`.
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            debug!(emergency_id = %timer.emergency_id, epoch = timer.epoch, "safety timer cancelled");
        }
    }

    async fn on_timer_expired(&mut self, epoch: u64) {
        let pending = self.timer.as_ref().is_some_and(|t| t.epoch == epoch);
        if !pending {
            debug!(epoch, "stale safety timer expiry ignored");
            return;
        }
        let Some(timer) = self.timer.take() else {
            return;
        };

        let still_waiting = self.current.as_ref().is_some_and(|ep| {
            ep.record.kind() == EmergencyKind::SafetyTimer && ep.record.id() == &timer.emergency_id
        });
        if !still_waiting {
            debug!(emergency_id = %timer.emergency_id, "safety timer expired for a finished episode");
            return;
        }

        warn!(
            emergency_id = %timer.emergency_id,
            "safety timer expired without check-in, escalating to SOS"
        );
        self.finish_current(Finish::TimerExpired).await;
        self.activate(EmergencyKind::Sos, None).await;
    }

    // --- History ---

    async fn clear_history(&mut self) {
        let cleared = self.history.len();
        self.history.clear();
        if let Some(episode) = self.current.as_mut() {
            episode.history_cleared = true;
        }
        info!(cleared, "emergency history cleared");

        self.publish();
        self.persist().await;
    }

    async fn set_notes(
        &mut self,
        id: EmergencyId,
        notes: Option<Notes>,
    ) -> Result<EmergencyRecord, EngineError> {
        if self.update_record(&id, |r| {
            r.set_notes(notes.clone());
            true
        })
        .is_none()
        {
            return Err(EngineError::NotFound(id));
        }

        let record = self.find_record(&id).ok_or_else(|| EngineError::NotFound(id.clone()))?;
        self.publish();
        self.persist().await;
        Ok(record)
    }

    /// Applies `f` to the current record and its history entry, keeping the
    /// two copies identical. Returns `None` if neither holds `id`.
    fn update_record<F>(&mut self, id: &EmergencyId, f: F) -> Option<bool>
    where
        F: Fn(&mut EmergencyRecord) -> bool,
    {
        let mut outcome = None;
        if let Some(episode) = self.current.as_mut().filter(|ep| ep.record.id() == id) {
            outcome = Some(f(&mut episode.record));
        }
        if let Some(record) = self.history.get_mut(id) {
            let changed = f(record);
            outcome.get_or_insert(changed);
        }
        outcome
    }

    fn find_record(&self, id: &EmergencyId) -> Option<EmergencyRecord> {
        self.current
            .as_ref()
            .filter(|ep| ep.record.id() == id)
            .map(|ep| ep.record.clone())
            .or_else(|| self.history.get(id).cloned())
    }

    // --- Publication ---

    fn publish(&self) {
        self.published.send_replace(EngineSnapshot {
            current: self.current.as_ref().map(|ep| ep.record.clone()),
            history: Arc::from(self.history.as_slice().to_vec()),
            safety_timer: self.timer.as_ref().map(|t| SafetyTimerStatus {
                emergency_id: t.emergency_id.clone(),
                deadline: t.deadline,
            }),
            history_recovered: self.history_recovered,
        });
    }

    async fn persist(&self) {
        let save = self.store.save(self.history.as_slice());
        match tokio::time::timeout(self.config.store_timeout(), save).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist emergency history"),
            Err(_) => warn!("history store timed out"),
        }
    }
}

/// Returns the stored records, or an empty history when they cannot be read.
async fn load_history(store: &dyn HistoryStore) -> (Vec<EmergencyRecord>, bool) {
    let error = match store.load().await {
        Ok(records) => return (records, false),
        Err(e) => e,
    };

    error!(error = %error, "emergency history unreadable, starting with an empty history");
    match store.set_aside().await {
        Ok(Some(path)) => warn!(path = %path.display(), "unreadable history set aside"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "could not set unreadable history aside"),
    }
    (Vec::new(), true)
}

fn on_dispatch_failed(id: &EmergencyId, error: &NotifyError) {
    warn!(emergency_id = %id, error = %error, "trusted contacts could not be notified");
}
