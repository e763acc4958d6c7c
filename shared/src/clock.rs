use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::UnixTimeMs;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

/// Wall clock. Jumps if the user changes the device time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(wall_clock_ms())
    }
}

/// Wall time sampled once, then advanced by the tokio monotonic clock.
///
/// Elapsed durations computed from this clock are immune to device time
/// changes, and under `tokio::time::pause` they follow simulated time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_ms: u64,
    anchor: tokio::time::Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(UnixTimeMs(wall_clock_ms()))
    }

    #[must_use]
    pub fn anchored_at(anchor: UnixTimeMs) -> Self {
        Self {
            anchor_ms: anchor.0,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> UnixTimeMs {
        let elapsed = u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX);
        UnixTimeMs(self.anchor_ms.saturating_add(elapsed))
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
