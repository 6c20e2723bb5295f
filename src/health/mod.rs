use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::registry::RouteRegistry;
use crate::models::Route;

#[derive(Debug, Default, Clone)]
struct Streak {
    consecutive_ok: u32,
    consecutive_fail: u32,
}

/// Monitor statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMonitorStats {
    pub probes_total: u64,
    pub probes_failed: u64,
    pub replicas_tracked: usize,
}

/// Probes every active route's replicas on the route's own interval and
/// flips replica health with consecutive-probe hysteresis.
///
/// A replica is degraded only after `unhealthy_threshold` consecutive
/// failed probes and recovers only after `healthy_threshold` consecutive
/// successes. Probes run outside any circuit breaker.
pub struct HealthMonitor {
    client: reqwest::Client,
    registry: Arc<RouteRegistry>,
    shutdown: Arc<RwLock<bool>>,
    streaks: Arc<RwLock<HashMap<(String, String), Streak>>>,
    probes_total: Arc<RwLock<u64>>,
    probes_failed: Arc<RwLock<u64>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            shutdown: Arc::new(RwLock::new(false)),
            streaks: Arc::new(RwLock::new(HashMap::new())),
            probes_total: Arc::new(RwLock::new(0)),
            probes_failed: Arc::new(RwLock::new(0)),
        }
    }

    /// Start probing every active route with health checking enabled
    pub async fn start(&self) {
        {
            let mut shutdown = self.shutdown.write().await;
            *shutdown = false;
        }

        for route in self.registry.list().await {
            self.watch_route(&route);
        }
    }

    /// Stop all probe loops. In-flight probes observe the flag and abandon
    /// their updates.
    pub async fn stop(&self) {
        let mut shutdown = self.shutdown.write().await;
        *shutdown = true;
        info!("health monitor stopped");
    }

    /// Schedule the recurring probe loop for one route. The loop exits on
    /// shutdown, when the route disappears, goes inactive, or is replaced
    /// by a re-put (the new route gets its own watcher).
    pub fn watch_route(&self, route: &Route) {
        if !route.active || !route.health_check.enabled {
            return;
        }

        let client = self.client.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let streaks = self.streaks.clone();
        let probes_total = self.probes_total.clone();
        let probes_failed = self.probes_failed.clone();

        let route_id = route.id.clone();
        let path = route.path.clone();
        let method = route.method.clone();
        let interval = Duration::from_millis(route.health_check.interval_ms.max(10));

        info!(path = %path, interval_ms = interval.as_millis() as u64, "health probes scheduled");

        tokio::spawn(async move {
            loop {
                if *shutdown.read().await {
                    break;
                }

                let Some(current) = registry.get(&path, &method).await else {
                    debug!(path = %path, "route gone, probe loop ending");
                    break;
                };
                if current.id != route_id || !current.active || !current.health_check.enabled {
                    debug!(path = %path, "route replaced or disabled, probe loop ending");
                    break;
                }

                for replica in &current.targets {
                    let probe_url = format!(
                        "{}{}",
                        replica.url.trim_end_matches('/'),
                        current.health_check.path
                    );
                    let timeout = Duration::from_millis(current.health_check.timeout_ms.max(1));

                    let started = Instant::now();
                    let result = client.get(&probe_url).timeout(timeout).send().await;
                    let latency_ms = started.elapsed().as_millis() as u64;

                    // A cancelled monitor abandons the outcome of any probe
                    // still in flight.
                    if *shutdown.read().await {
                        return;
                    }

                    let success = matches!(&result, Ok(response) if response.status().is_success());
                    *probes_total.write().await += 1;
                    if !success {
                        *probes_failed.write().await += 1;
                    }

                    let streak_key = (route_id.clone(), replica.url.clone());
                    let (ok_streak, fail_streak) = {
                        let mut streaks = streaks.write().await;
                        let streak = streaks.entry(streak_key).or_default();
                        if success {
                            streak.consecutive_ok += 1;
                            streak.consecutive_fail = 0;
                        } else {
                            streak.consecutive_fail += 1;
                            streak.consecutive_ok = 0;
                        }
                        (streak.consecutive_ok, streak.consecutive_fail)
                    };

                    if success {
                        registry
                            .update_replica_latency(&path, &method, &replica.url, latency_ms)
                            .await;
                        registry
                            .note_replica_success(&path, &method, &replica.url)
                            .await;

                        if !replica.healthy && ok_streak >= current.health_check.healthy_threshold
                        {
                            info!(url = %replica.url, path = %path, "replica recovered");
                            registry
                                .update_replica_health(&path, &method, &replica.url, true)
                                .await;
                        }
                    } else {
                        if let Err(e) = &result {
                            debug!(url = %probe_url, error = %e, "health probe failed");
                        }
                        registry
                            .record_replica_error(&path, &method, &replica.url)
                            .await;

                        if replica.healthy
                            && fail_streak >= current.health_check.unhealthy_threshold
                        {
                            warn!(url = %replica.url, path = %path, "replica degraded");
                            if !registry
                                .update_replica_health(&path, &method, &replica.url, false)
                                .await
                            {
                                error!(url = %replica.url, "failed to update replica health");
                            }
                        }
                    }
                }

                tokio::time::sleep(interval).await;
            }
        });
    }

    pub async fn stats(&self) -> HealthMonitorStats {
        HealthMonitorStats {
            probes_total: *self.probes_total.read().await,
            probes_failed: *self.probes_failed.read().await,
            replicas_tracked: self.streaks.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use axum::{routing::get, Router};
    use hyper::{Method, StatusCode};

    use crate::models::RouteSpec;

    async fn spawn_backend(healthy: bool) -> SocketAddr {
        let app = Router::new().route(
            "/health",
            get(move || async move {
                if healthy {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = axum::Server::bind(&addr).serve(app.into_make_service());
        let local = server.local_addr();
        tokio::spawn(async move {
            let _ = server.await;
        });
        local
    }

    async fn route_for(registry: &RouteRegistry, url: &str) -> Route {
        let spec: RouteSpec = serde_json::from_value(serde_json::json!({
            "path": "/api/monitored",
            "method": "GET",
            "targets": [{"url": url}],
            "health_check": {
                "enabled": true,
                "path": "/health",
                "interval_ms": 25,
                "timeout_ms": 500,
                "healthy_threshold": 1,
                "unhealthy_threshold": 2,
            },
        }))
        .unwrap();
        registry.put(spec).await.unwrap()
    }

    #[tokio::test]
    async fn degrades_after_consecutive_failures() {
        let backend = spawn_backend(false).await;
        let registry = Arc::new(RouteRegistry::new());
        let url = format!("http://{}", backend);
        let route = route_for(&registry, &url).await;

        let monitor = HealthMonitor::new(registry.clone());
        monitor.watch_route(&route);

        // Two consecutive failures are required before the flip
        tokio::time::sleep(Duration::from_millis(200)).await;
        let current = registry.get("/api/monitored", &Method::GET).await.unwrap();
        assert!(!current.targets[0].healthy);
        assert!(current.targets[0].total_errors >= 2);
        assert!(current.targets[0].last_check.is_some());

        monitor.stop().await;
    }

    #[tokio::test]
    async fn healthy_backend_stays_healthy() {
        let backend = spawn_backend(true).await;
        let registry = Arc::new(RouteRegistry::new());
        let url = format!("http://{}", backend);
        let route = route_for(&registry, &url).await;

        let monitor = HealthMonitor::new(registry.clone());
        monitor.watch_route(&route);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = registry.get("/api/monitored", &Method::GET).await.unwrap();
        assert!(current.targets[0].healthy);
        assert_eq!(current.targets[0].consecutive_errors, 0);

        let stats = monitor.stats().await;
        assert!(stats.probes_total >= 1);
        assert_eq!(stats.replicas_tracked, 1);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn unreachable_backend_is_degraded() {
        let registry = Arc::new(RouteRegistry::new());
        // Nothing listens on this port
        let route = route_for(&registry, "http://127.0.0.1:1").await;

        let monitor = HealthMonitor::new(registry.clone());
        monitor.watch_route(&route);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let current = registry.get("/api/monitored", &Method::GET).await.unwrap();
        assert!(!current.targets[0].healthy);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn disabled_health_check_spawns_no_probes() {
        let registry = Arc::new(RouteRegistry::new());
        let spec: RouteSpec = serde_json::from_value(serde_json::json!({
            "path": "/api/unmonitored",
            "method": "GET",
            "targets": [{"url": "http://127.0.0.1:1"}],
            "health_check": {"enabled": false, "path": "/health", "interval_ms": 10,
                              "timeout_ms": 100, "healthy_threshold": 1, "unhealthy_threshold": 1},
        }))
        .unwrap();
        let route = registry.put(spec).await.unwrap();

        let monitor = HealthMonitor::new(registry.clone());
        monitor.watch_route(&route);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.stats().await.probes_total, 0);

        let current = registry.get("/api/unmonitored", &Method::GET).await.unwrap();
        assert!(current.targets[0].healthy);
    }
}
