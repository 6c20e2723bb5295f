use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::Method;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::auth::models::{Permission, Role};

/// Serialize a `hyper::Method` as its string form
pub fn serialize_method<S>(method: &Method, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(method.as_str())
}

/// Deserialize a `hyper::Method` from a string
pub fn deserialize_method<'de, D>(deserializer: D) -> Result<Method, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Method::from_str(&s).map_err(|_| de::Error::custom(format!("invalid HTTP method: {}", s)))
}

/// One upstream endpoint of a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Base URL of the upstream
    pub url: String,

    /// Static weight for weighted balancing
    pub weight: u32,

    /// Whether the replica is currently considered healthy
    pub healthy: bool,

    /// When the replica was last probed
    pub last_check: Option<DateTime<Utc>>,

    /// Last observed response latency in milliseconds
    pub response_time_ms: u64,

    /// Consecutive errors observed against this replica
    pub consecutive_errors: u32,

    /// Total errors observed against this replica
    pub total_errors: u64,
}

impl Replica {
    /// Create a replica that is considered healthy until probed otherwise
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 1,
            healthy: true,
            last_check: None,
            response_time_ms: 0,
            consecutive_errors: 0,
            total_errors: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

/// Replica selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerPolicy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    HealthBased,
    Random,
}

impl Default for LoadBalancerPolicy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl FromStr for LoadBalancerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "least-response-time" => Ok(Self::LeastResponseTime),
            "health-based" => Ok(Self::HealthBased),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown load balancer policy: {}", other)),
        }
    }
}

/// Health probing policy for a route's replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub enabled: bool,

    /// Path appended to the replica base URL
    pub path: String,

    pub interval_ms: u64,
    pub timeout_ms: u64,

    /// Consecutive successful probes before an unhealthy replica recovers
    pub healthy_threshold: u32,

    /// Consecutive failed probes before a healthy replica is degraded
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            interval_ms: 30_000,
            timeout_ms: 5_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Circuit breaker policy for a route's replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,

    /// Failures within the window before the breaker opens
    pub threshold: u32,

    /// Sliding failure window length in milliseconds
    pub window_ms: u64,

    /// How long the breaker stays open before allowing a probe
    pub timeout_ms: u64,

    /// Body returned to clients while the breaker is open
    pub fallback_message: String,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_ms: 60_000,
            timeout_ms: 30_000,
            fallback_message: "Service temporarily unavailable".to_string(),
        }
    }
}

/// A registered route: (method, path pattern) plus policies and replicas
#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub id: String,

    pub path: String,

    #[serde(serialize_with = "serialize_method")]
    pub method: Method,

    pub targets: Vec<Replica>,

    pub balancer: LoadBalancerPolicy,

    pub health_check: HealthCheckPolicy,

    pub circuit_breaker: CircuitBreakerPolicy,

    /// Total per-request forwarding budget in milliseconds
    pub timeout_ms: u64,

    /// Retry attempts after the first failure
    pub retries: u32,

    pub active: bool,

    /// Public routes bypass token verification and authorization
    pub public: bool,

    /// Roles accepted for this route (ANY semantics; empty means any
    /// authenticated principal)
    pub required_roles: Vec<Role>,

    /// Permissions required for this route (empty means none)
    pub required_permissions: Vec<Permission>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Route key: the pair identifying a route in the registry
    pub fn key(&self) -> (String, String) {
        (self.method.to_string(), self.path.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_active() -> bool {
    true
}

/// One target in a route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Route definition accepted by the admin surface
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub path: String,

    #[serde(deserialize_with = "deserialize_method")]
    pub method: Method,

    pub targets: Vec<TargetSpec>,

    /// Absent means the gateway's configured default policy
    #[serde(default)]
    pub balancer: Option<LoadBalancerPolicy>,

    #[serde(default)]
    pub health_check: HealthCheckPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerPolicy,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub required_roles: Vec<Role>,

    #[serde(default)]
    pub required_permissions: Vec<Permission>,
}

impl RouteSpec {
    /// Materialize the definition into a route with a fresh id and
    /// timestamps.
    pub fn into_route(self, default_balancer: LoadBalancerPolicy) -> Route {
        let now = Utc::now();
        Route {
            id: Uuid::new_v4().to_string(),
            path: self.path,
            method: self.method,
            targets: self
                .targets
                .into_iter()
                .map(|t| Replica::new(t.url).with_weight(t.weight))
                .collect(),
            balancer: self.balancer.unwrap_or(default_balancer),
            health_check: self.health_check,
            circuit_breaker: self.circuit_breaker,
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            active: self.active,
            public: self.public,
            required_roles: self.required_roles,
            required_permissions: self.required_permissions,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_weight_floor_is_one() {
        let replica = Replica::new("http://localhost:8081").with_weight(0);
        assert_eq!(replica.weight, 1);
    }

    #[test]
    fn route_spec_materializes_with_fresh_identity() {
        let spec: RouteSpec = serde_json::from_value(serde_json::json!({
            "path": "/api/users",
            "method": "GET",
            "targets": [{"url": "http://localhost:8081"}, {"url": "http://localhost:8082", "weight": 3}],
        }))
        .unwrap();

        let route = spec.into_route(LoadBalancerPolicy::LeastConnections);
        assert_eq!(route.method, Method::GET);
        assert_eq!(route.targets.len(), 2);
        assert_eq!(route.targets[1].weight, 3);
        assert_eq!(route.balancer, LoadBalancerPolicy::LeastConnections);
        assert!(route.active);
        assert!(!route.public);
        assert!(!route.id.is_empty());
    }

    #[test]
    fn balancer_policy_parses_kebab_case() {
        assert_eq!(
            "least-response-time".parse::<LoadBalancerPolicy>().unwrap(),
            LoadBalancerPolicy::LeastResponseTime
        );
        assert!("unknown".parse::<LoadBalancerPolicy>().is_err());
    }
}
