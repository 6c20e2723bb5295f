use std::collections::HashMap;

use chrono::Utc;
use hyper::Method;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{ConfigError, GatewayError};
use crate::models::{LoadBalancerPolicy, Replica, Route, RouteSpec};

/// Compiled path pattern: `:name` matches one segment, a trailing `*`
/// matches any suffix.
#[derive(Debug, Clone)]
pub struct PathPattern {
    regex: Regex,
    param_names: Vec<String>,

    /// Literal characters before the first parameter or wildcard; longer
    /// prefixes are more specific
    literal_prefix_len: usize,

    /// Number of non-literal segments, used as a tie-break
    wildcard_segments: usize,
}

impl PathPattern {
    pub fn compile(path: &str) -> Result<Self, GatewayError> {
        let mut regex_pattern = String::from("^");
        let mut param_names = Vec::new();
        let mut literal_prefix_len = 0usize;
        let mut wildcard_segments = 0usize;
        let mut counting_prefix = true;

        let segments: Vec<&str> = path.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                regex_pattern.push('/');
                if counting_prefix {
                    literal_prefix_len += 1;
                }
            }

            if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(GatewayError::ConfigError(ConfigError::InvalidRoute(
                        format!("empty parameter name in '{}'", path),
                    )));
                }
                param_names.push(name.to_string());
                regex_pattern.push_str("([^/]+)");
                wildcard_segments += 1;
                counting_prefix = false;
            } else if *segment == "*" {
                if i != segments.len() - 1 {
                    return Err(GatewayError::ConfigError(ConfigError::InvalidRoute(
                        format!("wildcard must be the final segment in '{}'", path),
                    )));
                }
                regex_pattern.push_str("(.*)");
                wildcard_segments += 1;
                counting_prefix = false;
            } else {
                regex_pattern.push_str(&regex::escape(segment));
                if counting_prefix {
                    literal_prefix_len += segment.len();
                }
            }
        }
        regex_pattern.push('$');

        let regex = Regex::new(&regex_pattern).map_err(|e| {
            GatewayError::ConfigError(ConfigError::InvalidRoute(format!(
                "invalid route pattern '{}': {}",
                path, e
            )))
        })?;

        Ok(Self {
            regex,
            param_names,
            literal_prefix_len,
            wildcard_segments,
        })
    }

    /// Whether the pattern contains parameters or a wildcard
    pub fn is_dynamic(&self) -> bool {
        self.wildcard_segments > 0
    }

    /// Match a concrete path, returning extracted parameters
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let captures = self.regex.captures(path)?;
        let params = self
            .param_names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                captures
                    .get(i + 1)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(params)
    }
}

#[derive(Debug, Clone)]
struct RegisteredRoute {
    route: Route,
    pattern: PathPattern,
}

type RouteKey = (String, String);

fn route_key(method: &Method, path: &str) -> RouteKey {
    (method.to_string(), path.to_string())
}

/// Owns the route table and its replica health state.
///
/// Readers get cloned snapshots; later mutations do not retroactively
/// affect an in-flight dispatch.
pub struct RouteRegistry {
    routes: RwLock<HashMap<RouteKey, RegisteredRoute>>,

    /// Balancer policy applied when a route definition names none
    default_policy: LoadBalancerPolicy,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            default_policy: LoadBalancerPolicy::default(),
        }
    }

    pub fn with_default_policy(mut self, policy: LoadBalancerPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Seed the demo routes shipped with a fresh gateway
    pub async fn seed_demo_routes(&self) -> Result<(), GatewayError> {
        let demo: Vec<RouteSpec> = vec![
            serde_json::from_value(serde_json::json!({
                "path": "/api/users",
                "method": "GET",
                "targets": [
                    {"url": "http://localhost:4001"},
                    {"url": "http://localhost:4002"},
                ],
            }))
            .map_err(|e| GatewayError::InternalError(e.to_string()))?,
            serde_json::from_value(serde_json::json!({
                "path": "/api/orders",
                "method": "GET",
                "targets": [{"url": "http://localhost:4003"}],
            }))
            .map_err(|e| GatewayError::InternalError(e.to_string()))?,
        ];

        for spec in demo {
            self.put(spec).await?;
        }
        Ok(())
    }

    /// Create or replace the route for (method, path), generating a fresh
    /// id and timestamps.
    pub async fn put(&self, spec: RouteSpec) -> Result<Route, GatewayError> {
        if spec.targets.is_empty() {
            return Err(GatewayError::ConfigError(ConfigError::InvalidRoute(
                format!("route '{}' has no targets", spec.path),
            )));
        }

        let pattern = PathPattern::compile(&spec.path)?;
        let route = spec.into_route(self.default_policy);
        let key = route_key(&route.method, &route.path);

        let mut routes = self.routes.write().await;
        let replaced = routes
            .insert(
                key,
                RegisteredRoute {
                    route: route.clone(),
                    pattern,
                },
            )
            .is_some();

        info!(
            method = %route.method,
            path = %route.path,
            replaced,
            targets = route.targets.len(),
            "route registered"
        );
        Ok(route)
    }

    /// Exact (method, path) lookup
    pub async fn get(&self, path: &str, method: &Method) -> Option<Route> {
        let routes = self.routes.read().await;
        routes.get(&route_key(method, path)).map(|r| r.route.clone())
    }

    pub async fn delete(&self, path: &str, method: &Method) -> bool {
        let mut routes = self.routes.write().await;
        let removed = routes.remove(&route_key(method, path)).is_some();
        if removed {
            info!(method = %method, path, "route removed");
        }
        removed
    }

    pub async fn list(&self) -> Vec<Route> {
        let routes = self.routes.read().await;
        let mut list: Vec<Route> = routes.values().map(|r| r.route.clone()).collect();
        list.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| {
            a.method.as_str().cmp(b.method.as_str())
        }));
        list
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }

    /// Match a request path: exact key first, then active pattern routes of
    /// the same method, most specific (longest literal prefix, fewest
    /// wildcards) first. The query string takes no part in matching.
    pub async fn find_match(&self, path: &str, method: &Method) -> Option<Route> {
        let routes = self.routes.read().await;

        if let Some(registered) = routes.get(&route_key(method, path)) {
            if registered.route.active {
                return Some(registered.route.clone());
            }
        }

        let mut candidates: Vec<&RegisteredRoute> = routes
            .values()
            .filter(|r| {
                r.route.active && r.route.method == *method && r.pattern.is_dynamic()
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.pattern
                .literal_prefix_len
                .cmp(&a.pattern.literal_prefix_len)
                .then(a.pattern.wildcard_segments.cmp(&b.pattern.wildcard_segments))
                .then(a.route.path.cmp(&b.route.path))
        });

        candidates
            .into_iter()
            .find(|r| r.pattern.matches(path).is_some())
            .map(|r| r.route.clone())
    }

    /// The healthy replicas of a route, ready for the balancer
    pub async fn healthy_replicas(&self, path: &str, method: &Method) -> Vec<Replica> {
        let routes = self.routes.read().await;
        routes
            .get(&route_key(method, path))
            .map(|r| {
                r.route
                    .targets
                    .iter()
                    .filter(|t| t.healthy)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Flip a replica's health flag, stamping the check time
    pub async fn update_replica_health(
        &self,
        path: &str,
        method: &Method,
        replica_url: &str,
        healthy: bool,
    ) -> bool {
        let mut routes = self.routes.write().await;
        let Some(registered) = routes.get_mut(&route_key(method, path)) else {
            return false;
        };

        for replica in &mut registered.route.targets {
            if replica.url == replica_url {
                replica.healthy = healthy;
                replica.last_check = Some(Utc::now());
                registered.route.updated_at = Utc::now();
                return true;
            }
        }
        false
    }

    /// Record an observed latency for a replica
    pub async fn update_replica_latency(
        &self,
        path: &str,
        method: &Method,
        replica_url: &str,
        latency_ms: u64,
    ) -> bool {
        let mut routes = self.routes.write().await;
        let Some(registered) = routes.get_mut(&route_key(method, path)) else {
            return false;
        };

        for replica in &mut registered.route.targets {
            if replica.url == replica_url {
                replica.response_time_ms = latency_ms;
                return true;
            }
        }
        false
    }

    /// Count an error against a replica
    pub async fn record_replica_error(
        &self,
        path: &str,
        method: &Method,
        replica_url: &str,
    ) -> bool {
        let mut routes = self.routes.write().await;
        let Some(registered) = routes.get_mut(&route_key(method, path)) else {
            return false;
        };

        for replica in &mut registered.route.targets {
            if replica.url == replica_url {
                replica.consecutive_errors += 1;
                replica.total_errors += 1;
                return true;
            }
        }
        false
    }

    /// Note a successful call against a replica, easing its error count
    pub async fn note_replica_success(
        &self,
        path: &str,
        method: &Method,
        replica_url: &str,
    ) -> bool {
        let mut routes = self.routes.write().await;
        let Some(registered) = routes.get_mut(&route_key(method, path)) else {
            return false;
        };

        for replica in &mut registered.route.targets {
            if replica.url == replica_url {
                replica.consecutive_errors = replica.consecutive_errors.saturating_sub(1);
                return true;
            }
        }
        false
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}
