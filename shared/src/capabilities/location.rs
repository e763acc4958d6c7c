use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::model::Coordinate;

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current position, or `None` when unavailable. Never an error.
    async fn current_location(&self) -> Option<Coordinate>;
}

/// Provider that reports whatever position it was last given.
#[derive(Debug, Default)]
pub struct FixedLocationProvider {
    location: RwLock<Option<Coordinate>>,
    calls: AtomicUsize,
}

impl FixedLocationProvider {
    #[must_use]
    pub fn new(location: Option<Coordinate>) -> Self {
        Self {
            location: RwLock::new(location),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(None)
    }

    pub fn set(&self, location: Option<Coordinate>) {
        if let Ok(mut guard) = self.location.write() {
            *guard = location;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocationProvider for FixedLocationProvider {
    async fn current_location(&self) -> Option<Coordinate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.location.read().ok().and_then(|guard| *guard)
    }
}
