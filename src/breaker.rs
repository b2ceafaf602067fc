//! Circuit breaker shared by every worker in front of the extraction backend.
//!
//! ```text
//! closed    --threshold consecutive failures-->  open
//! open      --cooldown elapsed, next call-------> half_open (single trial)
//! half_open --trial succeeds------------------->  closed
//! half_open --trial fails---------------------->  open (cooldown restarts)
//! ```
//!
//! Callers take a [`Permit`] before touching the backend and settle it with
//! the outcome. Every transition happens under one lock, so only one caller
//! can ever become the half-open trial.

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("extraction circuit breaker is open")]
pub struct CircuitOpenError;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Ask to call the backend. Fails fast while open, and while a half-open
    /// trial is already outstanding.
    pub fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown);
                if !cooled {
                    return Err(CircuitOpenError);
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!("Circuit breaker half-open, admitting trial call");
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitOpenError);
                }
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Circuit breaker closed after successful trial");
        }
        // A call admitted before the breaker opened must not close it.
        if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!("Circuit breaker trial failed, reopening");
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.failure_count += 1;
        debug!(failure_count = inner.failure_count, "Backend call failed");
        if inner.failure_count >= self.config.failure_threshold.max(1) {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                failure_count = inner.failure_count,
                cooldown = ?self.config.cooldown,
                "Circuit breaker opened"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to call the backend once. Dropping an unsettled permit counts
/// as a failure so an abandoned half-open trial cannot wedge the breaker.
#[must_use = "settle the permit with the call outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Permit {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}
