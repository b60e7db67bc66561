//! Per-endpoint circuit breaker with timed half-open probing.
//!
//! Each replica URL gets its own breaker. Failures accumulate while the
//! circuit is closed; at the failure threshold the circuit opens and calls
//! fail fast without touching the provider. After the recovery timeout the
//! next call probes in half-open, and enough consecutive probe successes
//! close the circuit again. State transitions are applied atomically under
//! a per-breaker lock, which is never held across the wrapped operation.

use crate::clock::{Clock, MonotonicClock};
use crate::config::CircuitBreakerSettings;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-consistent snapshot of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at_millis: u64,
    success_count: u64,
    failure_count: u64,
    total_requests: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at_millis: 0,
            success_count: 0,
            failure_count: 0,
            total_requests: 0,
        }
    }
}

/// Circuit breaker guarding a single endpoint URL.
#[derive(Debug)]
pub struct EndpointCircuitBreaker {
    endpoint: String,
    settings: CircuitBreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl EndpointCircuitBreaker {
    pub fn new(endpoint: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            clock: Arc::new(MonotonicClock::default()),
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Effective state: an open circuit whose recovery timeout has elapsed
    /// reports half-open, since the next call would probe.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        self.effective_state(&inner)
    }

    /// Read-consistent counters.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: self.effective_state(&inner),
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            total_requests: inner.total_requests,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Reset to closed, clearing all transition counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at_millis = 0;
    }

    /// Run `op` through the breaker.
    ///
    /// While the circuit is open and the recovery timeout has not elapsed,
    /// fails fast with [`Error::CircuitOpen`] and does not invoke `op`.
    /// Otherwise the outcome of `op` is recorded against the transition
    /// table. A disabled breaker is a pass-through.
    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut() -> Fut,
    {
        if !self.settings.enabled {
            return op().await;
        }

        {
            let mut inner = self.lock();
            inner.total_requests += 1;

            if inner.state == CircuitState::Open {
                let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
                if elapsed >= self.settings.timeout().as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!(endpoint = %self.endpoint, "circuit breaker half-open, probing");
                } else {
                    return Err(Error::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        failure_count: inner.consecutive_failures,
                    });
                }
            }
        }

        let result = op().await;

        let mut inner = self.lock();
        match &result {
            Ok(_) => self.record_success(&mut inner),
            Err(_) => self.record_failure(&mut inner),
        }
        result
    }

    fn record_success(&self, inner: &mut BreakerInner) {
        inner.success_count += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at_millis = 0;
                    tracing::info!(endpoint = %self.endpoint, "circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            // A call that started before the circuit opened; its success
            // does not affect the open timer.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, inner: &mut BreakerInner) {
        inner.failure_count += 1;
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at_millis = self.clock.now_millis();
                inner.half_open_successes = 0;
                tracing::warn!(
                    endpoint = %self.endpoint,
                    "circuit breaker probe failed, reopening"
                );
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = self.clock.now_millis();
                    tracing::error!(
                        endpoint = %self.endpoint,
                        failures = inner.consecutive_failures,
                        threshold = self.settings.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn effective_state(&self, inner: &BreakerInner) -> CircuitState {
        if inner.state == CircuitState::Open {
            let elapsed = self.clock.now_millis().saturating_sub(inner.opened_at_millis);
            if elapsed >= self.settings.timeout().as_millis() as u64 {
                return CircuitState::HalfOpen;
            }
        }
        inner.state
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Query capability over per-endpoint breaker health.
///
/// The load balancer filters replicas through this trait instead of holding
/// the registry directly, keeping the registry a leaf.
pub trait EndpointHealth: Send + Sync {
    /// False when the endpoint's circuit is open (and unexpired).
    fn is_available(&self, endpoint: &str) -> bool;
}

/// Registry of breakers keyed by endpoint URL.
///
/// Breakers are created lazily on first observation of a URL and never
/// pruned within the process lifetime.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<EndpointCircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            clock: Arc::new(MonotonicClock::default()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Share one clock across all breakers (deterministic tests).
    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The breaker for `endpoint`, created on first use.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<EndpointCircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointCircuitBreaker {
                    endpoint: endpoint.to_string(),
                    settings: self.settings.clone(),
                    clock: self.clock.clone(),
                    inner: Mutex::new(BreakerInner::new()),
                })
            })
            .clone()
    }

    /// The breaker for `endpoint`, if one has been observed.
    pub fn get(&self, endpoint: &str) -> Option<Arc<EndpointCircuitBreaker>> {
        self.lock().get(endpoint).cloned()
    }

    /// Effective state of the breaker for `endpoint`, if observed.
    pub fn state_of(&self, endpoint: &str) -> Option<CircuitState> {
        self.get(endpoint).map(|breaker| breaker.state())
    }

    /// Sorted snapshot of all breaker states.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut entries: Vec<(String, CircuitState)> = self
            .lock()
            .iter()
            .map(|(url, breaker)| (url.clone(), breaker.state()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<EndpointCircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EndpointHealth for CircuitBreakerRegistry {
    fn is_available(&self, endpoint: &str) -> bool {
        self.state_of(endpoint) != Some(CircuitState::Open)
    }
}
