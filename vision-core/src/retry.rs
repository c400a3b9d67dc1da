//! Retry policy and the per-task attempt state machine.
//!
//! ```text
//! Pending ─start→ Attempting(1) ─ok→ Succeeded(1)
//!                     │
//!                     └─err→ Retrying(1, e) ─start→ Attempting(2) ─…
//!                     └─err, permanent or last attempt→ Failed(n, e)
//! ```

use crate::error::TaskError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `base * 2^(retry-1)`, capped, with symmetric jitter.
    Exponential { max_delay: Duration, jitter_pct: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        let backoff = match backoff {
            Backoff::Fixed => Backoff::Fixed,
            Backoff::Exponential {
                max_delay,
                jitter_pct,
            } => Backoff::Exponential {
                max_delay: max_delay.max(base_delay),
                jitter_pct: jitter_pct.clamp(0.0, 1.0),
            },
        };
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, Backoff::Fixed)
    }

    /// Delay to wait before `attempt` (1-based). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential {
                max_delay,
                jitter_pct,
            } => {
                let factor = 2u32.saturating_pow(attempt - 2);
                let delay = self.base_delay.saturating_mul(factor).min(max_delay);
                if jitter_pct > 0.0 {
                    let spread = delay.as_secs_f64() * jitter_pct;
                    let offset = rand::thread_rng().gen_range(-spread..=spread);
                    Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
                        .unwrap_or(delay)
                } else {
                    delay
                }
            }
        }
    }

    /// Drive `op` through the state machine until it reaches a terminal state.
    ///
    /// `op` receives the 1-based attempt number; `on_retry` is told about each
    /// scheduled retry before the delay is slept.
    pub fn drive<F, R>(&self, op: F, on_retry: R) -> AttemptState
    where
        F: FnMut(u32) -> Result<u64, TaskError>,
        R: FnMut(u32, &TaskError, Duration),
    {
        self.drive_with_sleep(op, on_retry, std::thread::sleep)
    }

    pub fn drive_with_sleep<F, R, S>(&self, mut op: F, mut on_retry: R, mut sleep: S) -> AttemptState
    where
        F: FnMut(u32) -> Result<u64, TaskError>,
        R: FnMut(u32, &TaskError, Duration),
        S: FnMut(Duration),
    {
        let mut state = AttemptState::Pending;
        // drawn once per retry so the reported and the slept delay agree
        let mut delay = Duration::ZERO;
        loop {
            state = state.start();
            let AttemptState::Attempting { attempt } = state else {
                return state;
            };
            if !delay.is_zero() {
                sleep(delay);
            }
            state = state.record(op(attempt), self);
            if let AttemptState::Retrying { attempt, error } = &state {
                delay = self.delay_before(attempt + 1);
                on_retry(*attempt, error, delay);
            }
            if state.is_terminal() {
                return state;
            }
        }
    }
}

/// Where a single task is in its retry lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, error: TaskError },
    Succeeded { attempts: u32, bytes: u64 },
    Failed { attempts: u32, error: TaskError },
}

impl AttemptState {
    /// Begin the next attempt. Terminal states are returned unchanged.
    pub fn start(self) -> Self {
        match self {
            AttemptState::Pending => AttemptState::Attempting { attempt: 1 },
            AttemptState::Retrying { attempt, .. } => AttemptState::Attempting {
                attempt: attempt + 1,
            },
            other => other,
        }
    }

    /// Fold the result of the current attempt into the state.
    pub fn record(self, result: Result<u64, TaskError>, policy: &RetryPolicy) -> Self {
        let AttemptState::Attempting { attempt } = self else {
            return self;
        };
        match result {
            Ok(bytes) => AttemptState::Succeeded {
                attempts: attempt,
                bytes,
            },
            Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                AttemptState::Retrying { attempt, error }
            }
            Err(error) => AttemptState::Failed {
                attempts: attempt,
                error,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded { .. } | AttemptState::Failed { .. }
        )
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            AttemptState::Pending => 0,
            AttemptState::Attempting { attempt } | AttemptState::Retrying { attempt, .. } => {
                *attempt
            }
            AttemptState::Succeeded { attempts, .. } | AttemptState::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}
