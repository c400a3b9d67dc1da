//! Global request spacing shared by every download worker.
//!
//! Each caller reserves the next free issuance slot under a lock and then
//! sleeps outside it, so slots handed out across all threads are spaced by
//! at least `min_spacing`. K requests therefore span at least
//! `(K - 1) * min_spacing` no matter how many workers are running.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateGate {
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// A gate that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// Block until this caller may issue a request. Returns the reserved slot.
    pub fn acquire(&self) -> Instant {
        let slot = self.reserve();
        let now = Instant::now();
        if slot > now {
            thread::sleep(slot - now);
        }
        slot
    }

    fn reserve(&self) -> Instant {
        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let slot = match *next {
            Some(t) if t > now => t,
            _ => now,
        };
        *next = Some(slot + self.min_spacing);
        slot
    }
}
