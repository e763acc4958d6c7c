#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use shared::capabilities::{ContactListDispatcher, FixedLocationProvider, InMemoryRecorder};
use shared::{
    Capabilities, ContactId, EmergencyEngine, EngineConfig, HistoryStore, MemoryHistoryStore,
    MonotonicClock, UnixTimeMs,
};

pub const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

pub struct Fixture {
    pub engine: EmergencyEngine,
    pub location: Arc<FixedLocationProvider>,
    pub dispatcher: Arc<ContactListDispatcher>,
    pub recorder: Arc<InMemoryRecorder>,
    pub store: Arc<MemoryHistoryStore>,
}

pub struct FixtureBuilder {
    location: Arc<FixedLocationProvider>,
    dispatcher: ContactListDispatcher,
    recorder: Arc<InMemoryRecorder>,
    store: Arc<MemoryHistoryStore>,
    config: EngineConfig,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            location: Arc::new(FixedLocationProvider::unavailable()),
            dispatcher: ContactListDispatcher::new(vec![
                ContactId::new("mom"),
                ContactId::new("neighbor"),
            ]),
            recorder: Arc::new(InMemoryRecorder::authorized()),
            store: Arc::new(MemoryHistoryStore::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn dispatcher(mut self, dispatcher: ContactListDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn store(mut self, store: Arc<MemoryHistoryStore>) -> Self {
        self.store = store;
        self
    }

    pub async fn start(self) -> Fixture {
        let dispatcher = Arc::new(self.dispatcher);
        let capabilities = Capabilities::new(
            self.location.clone(),
            dispatcher.clone(),
            self.recorder.clone(),
        );
        let store: Arc<dyn HistoryStore> = self.store.clone();
        let engine = EmergencyEngine::start(
            self.config,
            capabilities,
            store,
            Arc::new(MonotonicClock::anchored_at(T0)),
        )
        .await
        .expect("engine should start");

        Fixture {
            engine,
            location: self.location,
            dispatcher,
            recorder: self.recorder,
            store: self.store,
        }
    }
}

pub async fn fixture() -> Fixture {
    FixtureBuilder::new().start().await
}

/// Lets every spawned task run until the runtime is idle. Under paused time
/// this advances the clock by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn since_t0(at: UnixTimeMs) -> u64 {
    at.elapsed_since(T0)
}
