use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::trace;

use crate::models::{LoadBalancerPolicy, Replica};

/// Balancer statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub selections: u64,
    pub route_counters: HashMap<String, u64>,
    pub in_flight: HashMap<String, u64>,
}

/// Selects a replica from an already health-filtered list.
///
/// The balancer owns only its own counters: a per-route position for the
/// round-robin family and per-replica in-flight counts maintained by the
/// dispatch loop around each forwarding. It never mutates replicas.
pub struct LoadBalancer {
    counters: RwLock<HashMap<String, u64>>,
    in_flight: RwLock<HashMap<String, u64>>,
    selections: RwLock<u64>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            selections: RwLock::new(0),
        }
    }

    /// Pick a replica for the route. `replicas` must contain only healthy
    /// replicas; an empty list yields `None`. The sticky-session id is
    /// accepted but unused by the current policies.
    pub async fn select(
        &self,
        route_key: &str,
        policy: LoadBalancerPolicy,
        replicas: &[Replica],
        _sticky_session: Option<&str>,
    ) -> Option<Replica> {
        if replicas.is_empty() {
            return None;
        }

        *self.selections.write().await += 1;

        let selected = match policy {
            LoadBalancerPolicy::RoundRobin => {
                let position = self.next_position(route_key).await;
                replicas[(position % replicas.len() as u64) as usize].clone()
            }
            LoadBalancerPolicy::WeightedRoundRobin => {
                let total_weight: u64 = replicas.iter().map(|r| r.weight.max(1) as u64).sum();
                let position = self.next_position(route_key).await;
                let mut slot = (position % total_weight) as i64;

                let mut chosen = &replicas[0];
                for replica in replicas {
                    slot -= replica.weight.max(1) as i64;
                    if slot < 0 {
                        chosen = replica;
                        break;
                    }
                }
                chosen.clone()
            }
            LoadBalancerPolicy::LeastConnections => {
                let in_flight = self.in_flight.read().await;
                replicas
                    .iter()
                    .min_by_key(|r| in_flight.get(&r.url).copied().unwrap_or(0))
                    .cloned()?
            }
            LoadBalancerPolicy::LeastResponseTime => replicas
                .iter()
                .min_by_key(|r| r.response_time_ms)
                .cloned()?,
            LoadBalancerPolicy::HealthBased => replicas
                .iter()
                .min_by_key(|r| r.consecutive_errors)
                .cloned()?,
            LoadBalancerPolicy::Random => {
                let index = rand::thread_rng().gen_range(0..replicas.len());
                replicas[index].clone()
            }
        };

        trace!(route_key, policy = ?policy, url = %selected.url, "replica selected");
        Some(selected)
    }

    async fn next_position(&self, route_key: &str) -> u64 {
        let mut counters = self.counters.write().await;
        let counter = counters.entry(route_key.to_string()).or_insert(0);
        let position = *counter;
        *counter = counter.wrapping_add(1);
        position
    }

    /// Note a forwarding in flight against a replica
    pub async fn incr_in_flight(&self, replica_url: &str) {
        let mut in_flight = self.in_flight.write().await;
        *in_flight.entry(replica_url.to_string()).or_insert(0) += 1;
    }

    /// Note a forwarding completed against a replica
    pub async fn decr_in_flight(&self, replica_url: &str) {
        let mut in_flight = self.in_flight.write().await;
        if let Some(count) = in_flight.get_mut(replica_url) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(replica_url);
            }
        }
    }

    pub async fn in_flight(&self, replica_url: &str) -> u64 {
        let in_flight = self.in_flight.read().await;
        in_flight.get(replica_url).copied().unwrap_or(0)
    }

    /// Clear every counter
    pub async fn reset(&self) {
        self.counters.write().await.clear();
        self.in_flight.write().await.clear();
        *self.selections.write().await = 0;
    }

    pub async fn stats(&self) -> BalancerStats {
        BalancerStats {
            selections: *self.selections.read().await,
            route_counters: self.counters.read().await.clone(),
            in_flight: self.in_flight.read().await.clone(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(url: &str) -> Replica {
        Replica::new(url)
    }

    fn replica_with(url: &str, response_time_ms: u64, errors: u32, healthy: bool) -> Replica {
        let mut r = Replica::new(url);
        r.response_time_ms = response_time_ms;
        r.consecutive_errors = errors;
        r.healthy = healthy;
        r
    }

    #[tokio::test]
    async fn round_robin_alternates() {
        let balancer = LoadBalancer::new();
        let replicas = vec![replica("http://a"), replica("http://b")];

        let first = balancer
            .select("GET /api/x", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await
            .unwrap();
        let second = balancer
            .select("GET /api/x", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await
            .unwrap();
        let third = balancer
            .select("GET /api/x", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await
            .unwrap();

        assert_ne!(first.url, second.url);
        assert_eq!(first.url, third.url);
    }

    #[tokio::test]
    async fn round_robin_counters_are_per_route() {
        let balancer = LoadBalancer::new();
        let replicas = vec![replica("http://a"), replica("http://b")];

        let a = balancer
            .select("route-1", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await
            .unwrap();
        let b = balancer
            .select("route-2", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await
            .unwrap();

        // Each route starts from its own position
        assert_eq!(a.url, b.url);
    }

    #[tokio::test]
    async fn weighted_round_robin_follows_weights() {
        let balancer = LoadBalancer::new();
        let replicas = vec![
            replica("http://a").with_weight(3),
            replica("http://b").with_weight(1),
        ];

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..8 {
            let choice = balancer
                .select("r", LoadBalancerPolicy::WeightedRoundRobin, &replicas, None)
                .await
                .unwrap();
            *counts.entry(choice.url).or_insert(0) += 1;
        }

        assert_eq!(counts["http://a"], 6);
        assert_eq!(counts["http://b"], 2);
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_replica() {
        let balancer = LoadBalancer::new();
        let replicas = vec![replica("http://a"), replica("http://b")];

        balancer.incr_in_flight("http://a").await;
        balancer.incr_in_flight("http://a").await;
        balancer.incr_in_flight("http://b").await;

        let choice = balancer
            .select("r", LoadBalancerPolicy::LeastConnections, &replicas, None)
            .await
            .unwrap();
        assert_eq!(choice.url, "http://b");

        balancer.decr_in_flight("http://b").await;
        balancer.decr_in_flight("http://a").await;
        balancer.decr_in_flight("http://a").await;
        assert_eq!(balancer.in_flight("http://a").await, 0);
    }

    #[tokio::test]
    async fn least_response_time_and_health_based_pick_best() {
        let balancer = LoadBalancer::new();

        // Only the two healthy replicas are offered to the balancer
        let healthy = vec![
            replica_with("http://fast", 100, 0, true),
            replica_with("http://slow", 150, 1, true),
        ];

        let by_latency = balancer
            .select("r", LoadBalancerPolicy::LeastResponseTime, &healthy, None)
            .await
            .unwrap();
        assert_eq!(by_latency.url, "http://fast");

        let by_errors = balancer
            .select("r", LoadBalancerPolicy::HealthBased, &healthy, None)
            .await
            .unwrap();
        assert_eq!(by_errors.url, "http://fast");
    }

    #[tokio::test]
    async fn random_stays_within_the_offered_set() {
        let balancer = LoadBalancer::new();
        let replicas = vec![replica("http://a"), replica("http://b"), replica("http://c")];

        for _ in 0..20 {
            let choice = balancer
                .select("r", LoadBalancerPolicy::Random, &replicas, None)
                .await
                .unwrap();
            assert!(replicas.iter().any(|r| r.url == choice.url));
        }
    }

    #[tokio::test]
    async fn empty_list_yields_none() {
        let balancer = LoadBalancer::new();
        assert!(balancer
            .select("r", LoadBalancerPolicy::RoundRobin, &[], None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let balancer = LoadBalancer::new();
        let replicas = vec![replica("http://a"), replica("http://b")];

        let _ = balancer
            .select("r", LoadBalancerPolicy::RoundRobin, &replicas, None)
            .await;
        balancer.incr_in_flight("http://a").await;

        balancer.reset().await;
        let stats = balancer.stats().await;
        assert_eq!(stats.selections, 0);
        assert!(stats.route_counters.is_empty());
        assert!(stats.in_flight.is_empty());
    }
}
