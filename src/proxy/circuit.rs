//! Per-service circuit breaker.
//!
//! ```text
//! Closed   -> Open:     failure ratio above threshold within the window
//! Open     -> HalfOpen: cooldown elapsed
//! HalfOpen -> Closed:   the single trial call succeeds
//! HalfOpen -> Open:     the trial fails, cooldown grows by the multiplier
//! ```
//!
//! State only changes through call outcomes and the cooldown timer, and
//! every read-modify-write happens under one mutex.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::core::{metrics, CallError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: CircuitState,
    /// (finished at, succeeded) for calls made while closed.
    outcomes: VecDeque<(Instant, bool)>,
    failures: usize,
    opened_at: Instant,
    cooldown: Duration,
    reopens: u32,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: CircuitConfig) -> Self {
        let cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            service: service.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                failures: 0,
                opened_at: Instant::now(),
                cooldown,
                reopens: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state, with the cooldown timer applied.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.apply_cooldown(&mut inner, Instant::now());
        inner.state
    }

    /// Cooldown that currently applies (or will apply) to the open state.
    pub fn cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    /// Asks permission for one attempt.
    ///
    /// Fails with `CircuitOpen` while open, and while half open once the
    /// trial permit has been handed out.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CallError> {
        let mut inner = self.lock();
        self.apply_cooldown(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                info!("circuit for service '{}' admitting trial call", self.service);
                Ok(CircuitPermit::new(self, true))
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                Err(CallError::CircuitOpen(self.service.clone()))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_cooldown(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open && now.duration_since(inner.opened_at) >= inner.cooldown
        {
            inner.trial_in_flight = false;
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, state: CircuitState) {
        if inner.state != state {
            warn!(
                "circuit for service '{}': {} -> {}",
                self.service,
                inner.state.as_str(),
                state.as_str()
            );
            metrics::record_circuit_transition(&self.service, state.as_str());
            inner.state = state;
        }
    }

    fn on_outcome(&self, trial: bool, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();

        if trial {
            inner.trial_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if success {
                inner.reopens = 0;
                inner.cooldown = Duration::from_millis(self.config.cooldown_ms);
                inner.outcomes.clear();
                inner.failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            } else {
                inner.reopens += 1;
                let grown = self.config.cooldown_ms as f64
                    * self.config.backoff_multiplier.powi(inner.reopens as i32);
                let capped = grown.min(self.config.max_cooldown_ms as f64);
                inner.cooldown = Duration::from_millis(capped as u64);
                inner.opened_at = now;
                self.transition(&mut inner, CircuitState::Open);
            }
            return;
        }

        // results of calls admitted before the circuit tripped
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.outcomes.push_back((now, success));
        if !success {
            inner.failures += 1;
        }

        let window = Duration::from_millis(self.config.window_ms);
        while let Some(&(at, ok)) = inner.outcomes.front() {
            if now.duration_since(at) <= window {
                break;
            }
            inner.outcomes.pop_front();
            if !ok {
                inner.failures -= 1;
            }
        }

        let total = inner.outcomes.len();
        if total >= self.config.min_requests as usize
            && inner.failures as f64 / total as f64 > self.config.failure_ratio
        {
            inner.outcomes.clear();
            inner.failures = 0;
            inner.reopens = 0;
            inner.cooldown = Duration::from_millis(self.config.cooldown_ms);
            inner.opened_at = now;
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }
}

/// Permission for one attempt. Settle it with the attempt's outcome; a
/// trial permit dropped unsettled frees the trial slot.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
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
        self.breaker.on_outcome(self.trial, true);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_outcome(self.trial, false);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
