//! Replica selection across an endpoint's URLs.
//!
//! Strategies: round-robin, least-connections, random. Replicas whose
//! circuit is open are filtered out through the injected [`EndpointHealth`]
//! capability before selection. Callers bracket the chosen URL with
//! in-flight accounting; [`LoadBalancer::track`] returns an RAII guard so
//! the completion hook fires on every exit path.

use crate::circuit_breaker::EndpointHealth;
use crate::config::Strategy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct BalancerState {
    round_robin_index: u64,
    in_flight: HashMap<String, u32>,
}

/// Load balancer selecting one replica URL from a set.
pub struct LoadBalancer {
    strategy: Strategy,
    health: Option<Arc<dyn EndpointHealth>>,
    state: Mutex<BalancerState>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("health", &self.health.is_some())
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy, health: None, state: Mutex::new(BalancerState::default()) }
    }

    /// Filter unhealthy replicas through a breaker-state query capability.
    pub fn with_health(mut self, health: Arc<dyn EndpointHealth>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a replica URL, or `None` when every replica is filtered out.
    pub fn select(&self, endpoints: &[String]) -> Option<String> {
        if endpoints.is_empty() {
            return None;
        }

        let healthy: Vec<&String> = match &self.health {
            Some(health) => {
                endpoints.iter().filter(|url| health.is_available(url.as_str())).collect()
            }
            None => endpoints.iter().collect(),
        };

        if healthy.is_empty() {
            tracing::warn!(total = endpoints.len(), "all replicas unhealthy (circuit open)");
            return None;
        }

        let selected = match self.strategy {
            Strategy::RoundRobin => {
                let mut state = self.lock();
                let index = state.round_robin_index as usize % healthy.len();
                state.round_robin_index += 1;
                healthy[index].clone()
            }
            Strategy::LeastConnections => {
                let state = self.lock();
                healthy
                    .iter()
                    .min_by_key(|url| state.in_flight.get(url.as_str()).copied().unwrap_or(0))
                    .map(|url| (*url).clone())
                    .expect("healthy set is non-empty")
            }
            Strategy::Random => {
                use rand::Rng;
                let index = rand::rng().random_range(0..healthy.len());
                healthy[index].clone()
            }
        };

        tracing::debug!(strategy = ?self.strategy, %selected, "replica selected");
        Some(selected)
    }

    /// Record that a request is starting on `endpoint`.
    pub fn record_request(&self, endpoint: &str) {
        let mut state = self.lock();
        *state.in_flight.entry(endpoint.to_string()).or_insert(0) += 1;
    }

    /// Record that a request on `endpoint` completed. Clamps at zero.
    pub fn record_request_complete(&self, endpoint: &str) {
        let mut state = self.lock();
        if let Some(count) = state.in_flight.get_mut(endpoint) {
            *count = count.saturating_sub(1);
        }
    }

    /// Bracket a request with in-flight accounting; completion is recorded
    /// when the guard drops, on every exit path.
    pub fn track<'a>(&'a self, endpoint: &str) -> RequestGuard<'a> {
        self.record_request(endpoint);
        RequestGuard { balancer: self, endpoint: endpoint.to_string() }
    }

    /// Snapshot of in-flight request counts.
    pub fn stats(&self) -> HashMap<String, u32> {
        self.lock().in_flight.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RAII in-flight marker returned by [`LoadBalancer::track`].
#[must_use = "dropping the guard immediately records completion"]
pub struct RequestGuard<'a> {
    balancer: &'a LoadBalancer,
    endpoint: String,
}

impl RequestGuard<'_> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.balancer.record_request_complete(&self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn urls(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    struct FixedHealth {
        down: HashSet<String>,
    }

    impl EndpointHealth for FixedHealth {
        fn is_available(&self, endpoint: &str) -> bool {
            !self.down.contains(endpoint)
        }
    }

    #[test]
    fn empty_input_selects_nothing() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        assert_eq!(balancer.select(&[]), None);
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let balancer = LoadBalancer::new(Strategy::RoundRobin);
        let endpoints = urls(&["a", "b", "c"]);

        let picks: Vec<String> =
            (0..6).map(|_| balancer.select(&endpoints).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_skips_filtered_endpoints() {
        let health = Arc::new(FixedHealth { down: ["a".to_string()].into_iter().collect() });
        let balancer = LoadBalancer::new(Strategy::RoundRobin).with_health(health);
        let endpoints = urls(&["a", "b", "c"]);

        let picks: Vec<String> =
            (0..6).map(|_| balancer.select(&endpoints).unwrap()).collect();
        assert_eq!(picks, vec!["b", "c", "b", "c", "b", "c"]);
    }

    #[test]
    fn all_filtered_returns_none() {
        let health = Arc::new(FixedHealth {
            down: ["a".to_string(), "b".to_string()].into_iter().collect(),
        });
        let balancer = LoadBalancer::new(Strategy::RoundRobin).with_health(health);
        assert_eq!(balancer.select(&urls(&["a", "b"])), None);
    }

    #[test]
    fn least_connections_prefers_idle_endpoint() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        let endpoints = urls(&["a", "b"]);

        balancer.record_request("a");
        balancer.record_request("a");
        balancer.record_request("b");

        assert_eq!(balancer.select(&endpoints).unwrap(), "b");

        balancer.record_request("b");
        balancer.record_request("b");
        assert_eq!(balancer.select(&endpoints).unwrap(), "a");
    }

    #[test]
    fn least_connections_ties_break_by_iteration_order() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        assert_eq!(balancer.select(&urls(&["a", "b", "c"])).unwrap(), "a");
    }

    #[test]
    fn random_only_picks_from_the_set() {
        let balancer = LoadBalancer::new(Strategy::Random);
        let endpoints = urls(&["a", "b", "c"]);
        for _ in 0..50 {
            let pick = balancer.select(&endpoints).unwrap();
            assert!(endpoints.contains(&pick));
        }
    }

    #[test]
    fn completion_clamps_at_zero() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        balancer.record_request_complete("a");
        balancer.record_request("a");
        balancer.record_request_complete("a");
        balancer.record_request_complete("a");
        assert_eq!(balancer.stats().get("a").copied().unwrap_or(0), 0);
    }

    #[test]
    fn guard_records_completion_on_drop() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        {
            let guard = balancer.track("a");
            assert_eq!(guard.endpoint(), "a");
            assert_eq!(balancer.stats()["a"], 1);
        }
        assert_eq!(balancer.stats()["a"], 0);
    }

    #[test]
    fn guard_records_completion_even_when_panicking() {
        let balancer = Arc::new(LoadBalancer::new(Strategy::LeastConnections));
        let inner = balancer.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.track("a");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(balancer.stats()["a"], 0);
    }
}
