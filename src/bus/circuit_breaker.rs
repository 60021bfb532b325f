use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Breaker state as exposed to introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Seconds to reject before a half-open trial is allowed.
    pub cooldown_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Per-destination failure isolation. Closed admits deliveries; open
/// rejects them until the cooldown elapses; half-open admits exactly one
/// trial, closing on success and re-opening on failure.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    trial_pending: bool,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_pending: false,
            config,
        }
    }

    /// Whether a delivery attempt may proceed now. Moves open → half-open
    /// once the cooldown has elapsed and claims the single trial slot.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.cooldown_elapsed(now) {
                    self.state = BreakerState::HalfOpen;
                    self.trial_pending = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_pending {
                    false
                } else {
                    self.trial_pending = true;
                    true
                }
            }
        }
    }

    /// Read-only admission check used when filtering routing candidates;
    /// does not claim the half-open trial.
    pub fn is_callable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => self.cooldown_elapsed(now),
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_pending = false;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        match self.state {
            BreakerState::HalfOpen => self.trip(now),
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_pending = false;
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened_at) => now - opened_at >= Duration::seconds(self.config.cooldown_secs),
            None => true,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
