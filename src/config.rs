//! Centralized configuration for the reliability runtime.
//!
//! Settings are plain structs of primitives loaded once from `TETRA_*`
//! environment variables; a process-global accessor lazy-initializes the
//! active configuration and tests can swap in an explicit one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Load balancing strategies for endpoint selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

impl Strategy {
    /// Parse `TETRA_LB_STRATEGY` values; unknown strings fall back to
    /// round-robin.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "least_connections" => Strategy::LeastConnections,
            "random" => Strategy::Random,
            _ => Strategy::RoundRobin,
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// Seconds the circuit stays open before probing.
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Load balancer tuning.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadBalancerSettings {
    pub enabled: bool,
    pub strategy: Strategy,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self { enabled: false, strategy: Strategy::RoundRobin }
    }
}

/// Retry tuning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff.
    pub base_delay: f64,
    /// Cap on any single delay, in seconds.
    pub max_delay: f64,
    /// Symmetric jitter factor in `[0, 1]`.
    pub jitter: f64,
    /// HTTP statuses worth retrying.
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: 0.5,
            max_delay: 10.0,
            jitter: 0.2,
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetrySettings {
    pub fn base_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay.max(0.0))
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay.max(0.0))
    }
}

/// Metrics emission flag.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Centralized reliability configuration.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ReliabilityConfig {
    pub circuit_breaker: CircuitBreakerSettings,
    pub load_balancer: LoadBalancerSettings,
    pub retry: RetrySettings,
    pub metrics: MetricsSettings,
}

impl ReliabilityConfig {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables (malformed values fall back to defaults):
    /// - `TETRA_CIRCUIT_BREAKER_ENABLED`
    /// - `TETRA_CB_FAILURE_THRESHOLD`
    /// - `TETRA_CB_SUCCESS_THRESHOLD`
    /// - `TETRA_CB_TIMEOUT_SECONDS`
    /// - `TETRA_LOAD_BALANCER_ENABLED`
    /// - `TETRA_LB_STRATEGY` (`round_robin` / `least_connections` / `random`)
    /// - `TETRA_RETRY_ENABLED`
    /// - `TETRA_RETRY_MAX_ATTEMPTS`
    /// - `TETRA_RETRY_BASE_DELAY`
    /// - `TETRA_METRICS_ENABLED`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let circuit_breaker = CircuitBreakerSettings {
            enabled: env_bool("TETRA_CIRCUIT_BREAKER_ENABLED", defaults.circuit_breaker.enabled),
            failure_threshold: env_parse(
                "TETRA_CB_FAILURE_THRESHOLD",
                defaults.circuit_breaker.failure_threshold,
            ),
            success_threshold: env_parse(
                "TETRA_CB_SUCCESS_THRESHOLD",
                defaults.circuit_breaker.success_threshold,
            ),
            timeout_seconds: env_parse(
                "TETRA_CB_TIMEOUT_SECONDS",
                defaults.circuit_breaker.timeout_seconds,
            ),
        };

        let load_balancer = LoadBalancerSettings {
            enabled: env_bool("TETRA_LOAD_BALANCER_ENABLED", defaults.load_balancer.enabled),
            strategy: std::env::var("TETRA_LB_STRATEGY")
                .map(|v| Strategy::parse(&v))
                .unwrap_or(defaults.load_balancer.strategy),
        };

        let retry = RetrySettings {
            enabled: env_bool("TETRA_RETRY_ENABLED", defaults.retry.enabled),
            max_attempts: env_parse("TETRA_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
            base_delay: env_parse("TETRA_RETRY_BASE_DELAY", defaults.retry.base_delay),
            ..defaults.retry.clone()
        };

        let metrics = MetricsSettings {
            enabled: env_bool("TETRA_METRICS_ENABLED", defaults.metrics.enabled),
        };

        Self { circuit_breaker, load_balancer, retry, metrics }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

static CONFIG: Mutex<Option<Arc<ReliabilityConfig>>> = Mutex::new(None);

/// Process-global reliability configuration, lazily loaded from the
/// environment on first access.
pub fn reliability_config() -> Arc<ReliabilityConfig> {
    let mut slot = CONFIG.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.get_or_insert_with(|| Arc::new(ReliabilityConfig::from_env())).clone()
}

/// Replace the global configuration (primarily for tests).
pub fn set_reliability_config(config: ReliabilityConfig) {
    let mut slot = CONFIG.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(Arc::new(config));
}
