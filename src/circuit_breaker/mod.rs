use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::CircuitBreakerPolicy;
use crate::utils::now_ms;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,

    /// Failure timestamps (ms); pruned to the policy window on access
    failures: VecDeque<u64>,

    total_requests: u64,
    total_successes: u64,
    total_failures: u64,

    last_failure_ms: Option<u64>,
    last_success_ms: Option<u64>,

    /// When an OPEN breaker next allows a probe
    next_attempt_ms: u64,

    /// Last touch, for idle garbage collection
    last_activity_ms: u64,
}

impl Breaker {
    fn new(now: u64) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            last_failure_ms: None,
            last_success_ms: None,
            next_attempt_ms: 0,
            last_activity_ms: now,
        }
    }

    fn prune_window(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_sub(oldest) > window_ms {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Serializable view of one breaker instance
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub route_id: String,
    pub replica_url: String,
    pub state: BreakerState,
    pub window_failures: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_failure_ms: Option<u64>,
    pub last_success_ms: Option<u64>,
    pub next_attempt_ms: Option<u64>,
}

/// Per-(route, replica) circuit breakers, created lazily on first use.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Breaker>>,
}

fn breaker_key(route_id: &str, replica_url: &str) -> String {
    format!("{}|{}", route_id, replica_url)
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Gate a request. CLOSED and HALF_OPEN allow; OPEN denies until the
    /// retry deadline passes, at which point the breaker moves to
    /// HALF_OPEN and admits a single probe.
    pub async fn can_execute(
        &self,
        route_id: &str,
        replica_url: &str,
        policy: &CircuitBreakerPolicy,
    ) -> bool {
        if !policy.enabled {
            return true;
        }

        let now = now_ms();
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(breaker_key(route_id, replica_url))
            .or_insert_with(|| Breaker::new(now));
        breaker.last_activity_ms = now;

        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if now >= breaker.next_attempt_ms {
                    info!(route_id, replica_url, "circuit breaker half-open, probing");
                    breaker.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful upstream call. A success in HALF_OPEN closes the
    /// breaker and clears its failure window; CLOSED is unchanged.
    pub async fn record_success(
        &self,
        route_id: &str,
        replica_url: &str,
        policy: &CircuitBreakerPolicy,
    ) {
        if !policy.enabled {
            return;
        }

        let now = now_ms();
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(breaker_key(route_id, replica_url))
            .or_insert_with(|| Breaker::new(now));

        breaker.total_requests += 1;
        breaker.total_successes += 1;
        breaker.last_success_ms = Some(now);
        breaker.last_activity_ms = now;

        if breaker.state == BreakerState::HalfOpen {
            info!(route_id, replica_url, "circuit breaker closed after probe");
            breaker.state = BreakerState::Closed;
            breaker.failures.clear();
        }
    }

    /// Record a server-class failure. Opens the breaker once the pruned
    /// window reaches the policy threshold; a HALF_OPEN failure reopens
    /// immediately with a fresh retry deadline.
    pub async fn record_failure(
        &self,
        route_id: &str,
        replica_url: &str,
        policy: &CircuitBreakerPolicy,
    ) {
        if !policy.enabled {
            return;
        }

        let now = now_ms();
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(breaker_key(route_id, replica_url))
            .or_insert_with(|| Breaker::new(now));

        breaker.total_requests += 1;
        breaker.total_failures += 1;
        breaker.last_failure_ms = Some(now);
        breaker.last_activity_ms = now;

        match breaker.state {
            BreakerState::HalfOpen => {
                warn!(route_id, replica_url, "probe failed, circuit breaker reopened");
                breaker.state = BreakerState::Open;
                breaker.next_attempt_ms = now + policy.timeout_ms;
            }
            BreakerState::Closed => {
                breaker.failures.push_back(now);
                breaker.prune_window(now, policy.window_ms);

                if breaker.failures.len() >= policy.threshold as usize {
                    warn!(
                        route_id,
                        replica_url,
                        failures = breaker.failures.len(),
                        "failure threshold reached, circuit breaker opened"
                    );
                    breaker.state = BreakerState::Open;
                    breaker.next_attempt_ms = now + policy.timeout_ms;
                }
            }
            BreakerState::Open => {
                breaker.failures.push_back(now);
            }
        }
    }

    /// Current state, if an instance exists for the pair
    pub async fn state(&self, route_id: &str, replica_url: &str) -> Option<BreakerState> {
        let breakers = self.breakers.read().await;
        breakers
            .get(&breaker_key(route_id, replica_url))
            .map(|b| b.state)
    }

    /// Seconds until an OPEN breaker admits a probe
    pub async fn retry_after_secs(&self, route_id: &str, replica_url: &str) -> u64 {
        let breakers = self.breakers.read().await;
        breakers
            .get(&breaker_key(route_id, replica_url))
            .map(|b| (b.next_attempt_ms.saturating_sub(now_ms()) + 999) / 1000)
            .unwrap_or(0)
            .max(1)
    }

    /// Reset one breaker to CLOSED with an empty window
    pub async fn reset(&self, route_id: &str, replica_url: &str) -> bool {
        let mut breakers = self.breakers.write().await;
        breakers.remove(&breaker_key(route_id, replica_url)).is_some()
    }

    /// Drop every breaker instance
    pub async fn reset_all(&self) {
        let mut breakers = self.breakers.write().await;
        breakers.clear();
    }

    /// Remove instances with no activity for `max_idle`. Returns how many
    /// were collected.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(max_idle.as_millis() as u64);
        let mut breakers = self.breakers.write().await;
        let before = breakers.len();
        breakers.retain(|_, b| b.last_activity_ms >= cutoff);
        before - breakers.len()
    }

    pub async fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.read().await;
        breakers
            .iter()
            .map(|(key, b)| {
                let (route_id, replica_url) =
                    key.split_once('|').unwrap_or((key.as_str(), ""));
                BreakerStats {
                    route_id: route_id.to_string(),
                    replica_url: replica_url.to_string(),
                    state: b.state,
                    window_failures: b.failures.len(),
                    total_requests: b.total_requests,
                    total_successes: b.total_successes,
                    total_failures: b.total_failures,
                    last_failure_ms: b.last_failure_ms,
                    last_success_ms: b.last_success_ms,
                    next_attempt_ms: (b.state == BreakerState::Open)
                        .then_some(b.next_attempt_ms),
                }
            })
            .collect()
    }

    /// Force the retry deadline of an OPEN breaker (test support)
    #[cfg(test)]
    pub async fn force_next_attempt(&self, route_id: &str, replica_url: &str, at_ms: u64) {
        let mut breakers = self.breakers.write().await;
        if let Some(b) = breakers.get_mut(&breaker_key(route_id, replica_url)) {
            b.next_attempt_ms = at_ms;
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
