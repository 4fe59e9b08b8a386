//! Circuit breaker for the publish path.
//!
//! - **Closed**: requests pass, outcomes are counted. Counts are cleared every
//!   `interval`. The breaker trips when at least `min_requests` were seen and
//!   the failure rate reached `failure_ratio`, or after `consecutive_failures`
//!   failures in a row.
//! - **Open**: requests fail immediately with [`PipelineError::CircuitOpen`]
//!   for `timeout`.
//! - **Half-open**: up to `max_half_open_requests` probes pass. That many
//!   consecutive successes close the breaker; any failure opens it again.
//!   Extra probes fail with [`PipelineError::TooManyRequests`].
//!
//! Every state change starts a new generation with zeroed counts. Outcomes of
//! requests that started in an older generation are ignored.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;
use crate::utils::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_half_open_requests: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub min_requests: u32,
    pub consecutive_failures: u32,
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_half_open_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            min_requests: 5,
            consecutive_failures: 5,
            failure_ratio: 0.6,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            max_half_open_requests: settings.max_half_open_requests.max(1),
            interval: settings.interval(),
            timeout: settings.timeout(),
            min_requests: settings.min_requests,
            consecutive_failures: settings.consecutive_failures,
            failure_ratio: settings.failure_ratio,
        }
    }
}

/// Request outcomes within the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        {
            let mut inner = breaker.lock();
            breaker.new_generation(&mut inner, Instant::now());
        }
        breaker
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Run `operation` through the breaker.
    ///
    /// The operation is not polled at all while the breaker is open.
    pub async fn execute<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let generation = self.before_request()?;
        let result = operation.await;
        self.after_request(generation, result.is_ok());
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_request(&self) -> Result<u64> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Open => return Err(PipelineError::CircuitOpen),
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_half_open_requests => {
                return Err(PipelineError::TooManyRequests);
            }
            _ => {}
        }
        inner.counts.requests += 1;
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        match (inner.state, success) {
            (CircuitState::Closed, true) => inner.counts.on_success(),
            (CircuitState::Closed, false) => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_half_open_requests {
                    self.set_state(&mut inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, false) => self.set_state(&mut inner, CircuitState::Open, now),
            (CircuitState::Open, _) => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        let rate_tripped = counts.requests >= self.config.min_requests
            && counts.requests > 0
            && f64::from(counts.total_failures) / f64::from(counts.requests) >= self.config.failure_ratio;
        let streak_tripped =
            self.config.consecutive_failures > 0 && counts.consecutive_failures >= self.config.consecutive_failures;
        rate_tripped || streak_tripped
    }

    /// Apply time-driven transitions: the closed-state window rolling over and
    /// the open-state cooldown ending.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let expired = inner.expiry.is_some_and(|expiry| expiry <= now);
        match inner.state {
            CircuitState::Closed if expired => self.new_generation(inner, now),
            CircuitState::Open if expired => self.set_state(inner, CircuitState::HalfOpen, now),
            _ => {}
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }
        let from = inner.state;
        let counts = inner.counts;
        inner.state = state;
        self.new_generation(inner, now);

        match state {
            CircuitState::Open => warn!(
                circuit = %self.name,
                %from,
                requests = counts.requests,
                failures = counts.total_failures,
                consecutive_failures = counts.consecutive_failures,
                "circuit breaker opened"
            ),
            _ => info!(circuit = %self.name, %from, to = %state, "circuit breaker state changed"),
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.config.interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.config.interval),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}
