//! Per-instance circuit breaker
//!
//! ```text
//! closed ──N failures in window──► open ──cool-down elapsed──► half-open
//!   ▲                               ▲                              │
//!   └────────── trial succeeded ────┼──────────────────────────────┤
//!                                   └── trial failed (cool-down ×2, capped)
//! ```
//!
//! While open, [`CircuitBreaker::try_acquire`] refuses without touching the
//! network. Half-open admits exactly one trial call at a time.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// State change reported by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures inside the rolling window
    pub recent_failures: usize,
    /// Open period applied on the next trip
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    cooldown: Duration,
    trial_started: Option<Instant>,
}

/// Circuit breaker for one instance
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                open_until: None,
                cooldown,
                trial_started: None,
            }),
        }
    }

    /// Effective state, reporting an expired open period as half-open
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.open_until) {
            (CircuitState::Open, Some(until)) if now >= until => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Whether a call would be admitted, without consuming the half-open trial
    pub fn would_allow(&self) -> bool {
        self.would_allow_at(Instant::now())
    }

    pub fn would_allow_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.open_until.is_some_and(|until| now >= until),
            CircuitState::HalfOpen => !self.trial_pending(&inner, now),
        }
    }

    /// Ask to make a call.
    ///
    /// Returns whether the call may proceed, plus the transition to
    /// half-open if this call became the trial.
    pub fn try_acquire(&self) -> (bool, Option<Transition>) {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> (bool, Option<Transition>) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if inner.open_until.is_some_and(|until| now >= until) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    debug!("Circuit half-open, admitting trial call");
                    (
                        true,
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    )
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_pending(&inner, now) {
                    (false, None)
                } else {
                    inner.trial_started = Some(now);
                    (true, None)
                }
            }
        }
    }

    /// Record a successful call or probe
    pub fn record_success(&self) -> Option<Transition> {
        self.record_success_at(Instant::now())
    }

    pub fn record_success_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock();
        let effective = match (inner.state, inner.open_until) {
            (CircuitState::Open, Some(until)) if now >= until => CircuitState::HalfOpen,
            (state, _) => state,
        };
        if effective != CircuitState::HalfOpen {
            return None;
        }

        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.open_until = None;
        inner.trial_started = None;
        inner.cooldown = self.config.cooldown;
        debug!("Circuit closed after successful trial");
        Some(Transition {
            from,
            to: CircuitState::Closed,
        })
    }

    /// Record a failed call or probe
    pub fn record_failure(&self) -> Option<Transition> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> Option<Transition> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.config.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(now + inner.cooldown);
                    warn!(
                        "Circuit opened after {} failures, cooling down for {:?}",
                        inner.failures.len(),
                        inner.cooldown
                    );
                    return Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    });
                }
                None
            }
            CircuitState::HalfOpen => {
                inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
                inner.state = CircuitState::Open;
                inner.open_until = Some(now + inner.cooldown);
                inner.trial_started = None;
                warn!(
                    "Circuit trial failed, reopening for {:?}",
                    inner.cooldown
                );
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => None,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitSnapshot {
            state,
            recent_failures: inner.failures.len(),
            cooldown: inner.cooldown,
        }
    }

    /// An unanswered trial blocks further trials for one cool-down period
    fn trial_pending(&self, inner: &BreakerState, now: Instant) -> bool {
        inner
            .trial_started
            .is_some_and(|started| now.saturating_duration_since(started) < inner.cooldown)
    }
}
