//! Retry executor with jittered exponential backoff.
//!
//! Wraps an async operation and retries transient provider failures.
//! Delays double from `base_delay` up to `max_delay` with symmetric jitter.
//! When a circuit breaker is attached, an open circuit aborts the remaining
//! retries instead of hammering a dead endpoint.

use crate::backoff::Backoff;
use crate::circuit_breaker::{CircuitState, EndpointCircuitBreaker};
use crate::config::RetrySettings;
use crate::error::{Error, Result};
use crate::jitter::Jitter;
use crate::pause::{RetryPause, TimerPause};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Kind-level retryability predicate over crate errors.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Configurable retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    retryable_status_codes: HashSet<u16>,
    should_retry: RetryPredicate,
    breaker: Option<Arc<EndpointCircuitBreaker>>,
    pause: Arc<dyn RetryPause>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("breaker", &self.breaker.as_ref().map(|b| b.endpoint().to_string()))
            .field("pause", &self.pause)
            .finish()
    }
}

impl RetryPolicy {
    /// Build a policy from [`RetrySettings`]. A disabled policy runs the
    /// operation exactly once.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: if settings.enabled { settings.max_attempts.max(1) } else { 1 },
            backoff: Backoff::exponential(
                settings.base_delay_duration(),
                settings.max_delay_duration(),
            ),
            jitter: Jitter::new(settings.jitter),
            retryable_status_codes: settings.retryable_status_codes.clone(),
            should_retry: Arc::new(Error::is_provider_unavailable),
            breaker: None,
            pause: Arc::new(TimerPause),
        }
    }

    /// Attach a circuit breaker consulted before each attempt after the
    /// first.
    pub fn with_breaker(mut self, breaker: Arc<EndpointCircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Replace the kind-level retryability predicate.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_pause<P: RetryPause + 'static>(mut self, pause: P) -> Self {
        self.pause = Arc::new(pause);
        self
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Attempt 1 runs immediately. Between attempts the executor sleeps
    /// `min(max_delay, base_delay * 2^(i-1))` jittered. Non-retryable
    /// errors are re-raised immediately; exhausting `max_attempts` yields
    /// [`Error::RetryExhausted`] wrapping the last cause.
    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut() -> Fut,
    {
        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                if let Some(breaker) = &self.breaker {
                    if breaker.state() == CircuitState::Open {
                        let stats = breaker.stats();
                        tracing::warn!(
                            endpoint = breaker.endpoint(),
                            attempt,
                            "circuit open, aborting remaining retries"
                        );
                        return Err(Error::CircuitOpen {
                            endpoint: breaker.endpoint().to_string(),
                            failure_count: stats.consecutive_failures,
                        });
                    }
                }
            }

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, max_attempts = self.max_attempts, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !self.is_retryable(&error) {
                        tracing::debug!(attempt, %error, "non-retryable error");
                        return Err(error);
                    }
                    tracing::debug!(attempt, max_attempts = self.max_attempts, %error, "retryable failure");
                    last_error = Some(error);

                    if attempt < self.max_attempts {
                        let delay = self.jitter.apply(self.backoff.delay(attempt));
                        self.pause.wait(delay, attempt + 1).await;
                    }
                }
            }
        }

        let cause = last_error.unwrap_or(Error::ProviderUnavailable {
            message: "no attempts executed".into(),
            status: None,
        });
        tracing::warn!(attempts = self.max_attempts, "retries exhausted");
        Err(Error::RetryExhausted {
            attempts: self.max_attempts,
            source: Box::new(cause),
        })
    }

    fn is_retryable(&self, error: &Error) -> bool {
        if !(self.should_retry)(error) {
            return false;
        }
        match error.status_code() {
            Some(status) => self.retryable_status_codes.contains(&status),
            None => true,
        }
    }
}
