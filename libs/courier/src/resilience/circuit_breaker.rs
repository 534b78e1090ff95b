//! Sliding-window circuit breaker.
//!
//! State machine:
//! - `Closed`: calls pass; outcomes land in a time window. Once the window
//!   holds at least `minimum_requests` samples and the failure rate reaches
//!   `failure_threshold`, the circuit opens.
//! - `Open`: calls are rejected with `circuit-open` until `reset_timeout` has
//!   elapsed; the next call then moves the circuit to `HalfOpen`.
//! - `HalfOpen`: up to `half_open_max_requests` trial calls run concurrently.
//!   `success_threshold` consecutive successes close the circuit, any failure
//!   reopens it.

use crate::error::{ErrorCode, ErrorKind, HttpError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failure rate in `(0.0, 1.0]` that opens the circuit (default: 0.5)
    pub failure_threshold: f64,
    /// Samples required in the window before the rate is trusted (default: 10)
    pub minimum_requests: usize,
    /// Age of the oldest sample considered (default: 60s)
    #[serde(with = "crate::humantime_serde")]
    pub window: Duration,
    /// Time spent open before trial calls are let through (default: 30s)
    #[serde(with = "crate::humantime_serde")]
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close (default: 2)
    pub success_threshold: usize,
    /// Concurrent trial calls while half-open (default: 1)
    pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_requests: 10,
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// # Errors
    ///
    /// Returns a `validation` error describing the first invalid field.
    pub fn validate(&self) -> Result<(), HttpError> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(HttpError::config(format!(
                "circuit breaker failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.minimum_requests == 0 {
            return Err(HttpError::config(
                "circuit breaker minimum_requests must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(HttpError::config(
                "circuit breaker success_threshold must be at least 1",
            ));
        }
        if self.half_open_max_requests == 0 {
            return Err(HttpError::config(
                "circuit breaker half_open_max_requests must be at least 1",
            ));
        }
        if self.window.is_zero() {
            return Err(HttpError::config("circuit breaker window must be non-zero"));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    /// Failure rate over the current window
    pub failure_rate: f64,
    pub window_samples: usize,
    pub forced: bool,
}

/// How a finished call counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Neither; e.g. the caller cancelled
    Ignored,
}

impl Outcome {
    fn of<T>(result: &Result<T, HttpError>) -> Self {
        let Err(err) = result else {
            return Self::Success;
        };
        match err.code() {
            ErrorCode::Network | ErrorCode::Timeout | ErrorCode::Parse | ErrorCode::Unknown => {
                Self::Failure
            }
            ErrorCode::BadResponse => match err.status() {
                Some(status)
                    if status.is_server_error()
                        || status == http::StatusCode::REQUEST_TIMEOUT
                        || status == http::StatusCode::TOO_MANY_REQUESTS =>
                {
                    Self::Failure
                }
                // The endpoint answered; a 4xx says nothing about its health.
                Some(_) => Self::Success,
                None => Self::Ignored,
            },
            ErrorCode::Cancelled
            | ErrorCode::Validation
            | ErrorCode::CircuitOpen
            | ErrorCode::NoAdapter => Self::Ignored,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    window: VecDeque<(Instant, bool)>,
    consecutive_successes: usize,
    half_open_in_flight: usize,
    forced: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            window: VecDeque::new(),
            consecutive_successes: 0,
            half_open_in_flight: 0,
            forced: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        ratio(failures, self.window.len())
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let part = u32::try_from(part).unwrap_or(u32::MAX);
    let whole = u32::try_from(whole).unwrap_or(u32::MAX);
    f64::from(part) / f64::from(whole)
}

/// Named circuit breaker guarding one endpoint.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

/// Ticket for one admitted call. Dropping it unsettled releases a
/// half-open slot without recording an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    admitted_in: CircuitState,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.admitted_in, outcome);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.admitted_in, Outcome::Ignored);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due `Open -> HalfOpen` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    /// Run `call` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns `circuit-open` without running `call` while the circuit is
    /// open or the half-open trial budget is spent; otherwise returns the
    /// call's own result.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T, HttpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let admission = self.admit()?;
        let result = call().await;
        admission.settle(Outcome::of(&result));
        result
    }

    fn admit(&self) -> Result<Admission<'_>, HttpError> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.forced || inner.half_open_in_flight >= self.config.half_open_max_requests
                {
                    false
                } else {
                    inner.half_open_in_flight += 1;
                    true
                }
            }
        };
        if !admitted {
            drop(inner);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(breaker = %self.name, "circuit open; call rejected");
            return Err(ErrorKind::CircuitOpen {
                name: self.name.clone(),
            }
            .into());
        }
        let admitted_in = inner.state;
        drop(inner);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(Admission {
            breaker: self,
            admitted_in,
            settled: false,
        })
    }

    fn maybe_half_open(&self, inner: &mut BreakerState, now: Instant) {
        if inner.forced || inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.reset_timeout);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.half_open_in_flight = 0;
            tracing::info!(breaker = %self.name, "circuit half-open; allowing trial calls");
        }
    }

    fn record(&self, admitted_in: CircuitState, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Ignored => {}
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        if admitted_in == CircuitState::HalfOpen && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if inner.forced || outcome == Outcome::Ignored {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back((now, outcome == Outcome::Success));
                inner.prune(now, self.config.window);
                if outcome == Outcome::Failure && inner.window.len() >= self.config.minimum_requests
                {
                    let rate = inner.failure_rate();
                    if rate >= self.config.failure_threshold {
                        Self::trip(&mut inner, now);
                        tracing::warn!(
                            breaker = %self.name,
                            failure_rate = rate,
                            samples = inner.window.len(),
                            "circuit opened"
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                if outcome == Outcome::Success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        *inner = BreakerState::closed();
                        tracing::info!(breaker = %self.name, "circuit closed");
                    }
                } else {
                    Self::trip(&mut inner, now);
                    tracing::warn!(breaker = %self.name, "trial call failed; circuit reopened");
                }
            }
            // Late result of a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    fn trip(inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
    }

    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.maybe_half_open(&mut inner, now);
        inner.prune(now, self.config.window);
        CircuitBreakerStats {
            state: inner.state,
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successes.load(Ordering::Relaxed),
            failed_requests: self.failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            failure_rate: inner.failure_rate(),
            window_samples: inner.window.len(),
            forced: inner.forced,
        }
    }

    /// Back to a clean `Closed` state; counters restart and forcing is lifted.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        for counter in [&self.total, &self.successes, &self.failures, &self.rejected] {
            counter.store(0, Ordering::Relaxed);
        }
        tracing::info!(breaker = %self.name, "circuit reset");
    }

    /// Reject every call until [`reset`](Self::reset).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.forced = true;
        tracing::warn!(breaker = %self.name, "circuit forced open");
    }

    /// Admit every call until [`reset`](Self::reset); outcomes are counted
    /// but never trip the circuit.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState::closed();
        inner.forced = true;
        tracing::warn!(breaker = %self.name, "circuit forced closed");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
