//! Circuit breaker for upstream throttling and IP bans.
//!
//! HTTP 403 from the data repository means the host is refusing us; repeated
//! 429s mean we are being throttled. Either way, every further request in
//! the run would fail, so the breaker opens and workers fail fast for the
//! cooldown instead of burning their retry budget.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_throttles: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cooldown: Duration,
    throttle_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, throttle_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_throttles: 0,
            }),
            cooldown,
            throttle_threshold: throttle_threshold.max(1),
        }
    }

    /// 30-minute cooldown, opens after 3 consecutive throttled responses.
    pub fn default_upstream() -> Self {
        Self::new(Duration::from_secs(30 * 60), 3)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether requests may be issued right now.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } if tripped_at.elapsed() >= self.cooldown => {
                inner.state = BreakerState::Closed;
                inner.consecutive_throttles = 0;
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_throttles = 0;
    }

    /// Count a 429. Opens the breaker once the threshold is reached.
    pub fn record_throttle(&self) {
        let mut inner = self.lock();
        inner.consecutive_throttles += 1;
        if inner.consecutive_throttles >= self.throttle_threshold {
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// Open immediately (403 / IP ban).
    pub fn trip(&self) {
        self.lock().state = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match self.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => self.cooldown.saturating_sub(tripped_at.elapsed()),
        }
    }
}
