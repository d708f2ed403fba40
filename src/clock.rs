//! Wall-clock abstraction so device skew can be simulated and timing guards tested
//! deterministically.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Source of "now" for every timing decision taken on a device.
pub trait Clock: Send + Sync {
    /// Current wall-clock time as seen by this device.
    fn now(&self) -> SystemTime;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock used by tests and simulations.
///
/// Clones share the same underlying instant, so a test can keep one handle and
/// advance time for every component holding another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += delta;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: SystemTime) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Elapsed time from `earlier` to `later`, clamped to zero when `earlier` lies in the future.
pub fn elapsed_between(earlier: SystemTime, later: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// Milliseconds since the Unix epoch, used for device-local persisted stamps.
pub fn to_millis(instant: SystemTime) -> u64 {
    instant
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inverse of [`to_millis`].
pub fn from_millis(millis: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
}
