use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::HeaderMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::Principal;
use crate::config::RateLimitConfig;
use crate::utils::now_ms;

/// The request attributes a rate-limit rule can key on
#[derive(Debug, Clone)]
pub struct RateSubject {
    pub ip: String,
    pub user: Option<String>,
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
}

impl RateSubject {
    pub fn new(
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
        method: &str,
        path: &str,
        principal: Option<&Principal>,
    ) -> Self {
        Self {
            ip: client_ip(headers, remote),
            user: principal.map(|p| p.id.clone()),
            path: path.to_string(),
            method: method.to_string(),
            user_agent: headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
        }
    }
}

/// Client IP derivation: `X-Forwarded-For` first entry, then `X-Real-IP`,
/// then the transport remote address.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A fixed-window rate limit rule
#[derive(Clone)]
pub struct RateLimitRule {
    pub name: &'static str,

    /// Key template with `{ip}`, `{user}`, `{path}`, `{method}`,
    /// `{user-agent}` placeholders
    pub key_template: String,

    pub limit: u64,
    pub window: Duration,

    /// When set and returning true for a subject, the rule is skipped
    pub skip: Option<fn(&RateSubject) -> bool>,
}

impl std::fmt::Debug for RateLimitRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitRule")
            .field("name", &self.name)
            .field("key_template", &self.key_template)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish()
    }
}

impl RateLimitRule {
    pub fn new(name: &'static str, key_template: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            name,
            key_template: key_template.into(),
            limit,
            window,
            skip: None,
        }
    }

    pub fn with_skip(mut self, skip: fn(&RateSubject) -> bool) -> Self {
        self.skip = Some(skip);
        self
    }

    fn render_key(&self, subject: &RateSubject) -> String {
        self.key_template
            .replace("{ip}", &subject.ip)
            .replace("{user}", subject.user.as_deref().unwrap_or("anonymous"))
            .replace("{path}", &subject.path)
            .replace("{method}", &subject.method)
            .replace(
                "{user-agent}",
                subject.user_agent.as_deref().unwrap_or("unknown"),
            )
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub total_hits: u64,
    pub remaining: u64,

    /// When the governing window resets, ms since the Unix epoch
    pub reset_at_ms: u64,

    /// Seconds to wait before retrying; set on denial
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            total_hits: 0,
            remaining: u64::MAX,
            reset_at_ms: 0,
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Window {
    count: u64,
    started_at_ms: u64,
    reset_at_ms: u64,
}

/// Serializable view of one active window
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    pub key: String,
    pub count: u64,
    pub started_at_ms: u64,
    pub reset_at_ms: u64,
}

/// Aggregate limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_windows: usize,
    pub total_allowed: u64,
    pub total_denied: u64,
}

/// Fixed-window rate limiter keyed by rule-templated strings.
pub struct RateLimiter {
    windows: RwLock<HashMap<String, Window>>,
    allowed: RwLock<u64>,
    denied: RwLock<u64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            allowed: RwLock::new(0),
            denied: RwLock::new(0),
        }
    }

    /// Evaluate every applicable rule for the subject. The overall decision
    /// is the first denial; otherwise the most restrictive rule's state.
    pub async fn check(&self, subject: &RateSubject, rules: &[RateLimitRule]) -> RateLimitDecision {
        let now = now_ms();
        let mut most_restrictive: Option<RateLimitDecision> = None;

        let mut windows = self.windows.write().await;

        for rule in rules {
            if rule.skip.map(|skip| skip(subject)).unwrap_or(false) {
                continue;
            }

            let key = rule.render_key(subject);
            let window_ms = rule.window.as_millis() as u64;

            let expired = windows
                .get(&key)
                .map(|w| now >= w.reset_at_ms)
                .unwrap_or(true);
            if expired {
                windows.insert(
                    key.clone(),
                    Window {
                        count: 0,
                        started_at_ms: now,
                        reset_at_ms: now + window_ms,
                    },
                );
            }
            let window = windows.get_mut(&key).expect("window present");

            if window.count >= rule.limit {
                let reset_at_ms = window.reset_at_ms;
                let retry_after = (reset_at_ms.saturating_sub(now) + 999) / 1000;
                drop(windows);

                debug!(rule = rule.name, key = %key, "rate limit exceeded");
                *self.denied.write().await += 1;

                return RateLimitDecision {
                    allowed: false,
                    limit: rule.limit,
                    // The denying rule's window is not incremented, so its
                    // hits sit exactly at the limit. Rules evaluated before
                    // it in this pass have already counted the request.
                    total_hits: rule.limit,
                    remaining: 0,
                    reset_at_ms,
                    retry_after_secs: Some(retry_after.max(1)),
                };
            }

            window.count += 1;
            let decision = RateLimitDecision {
                allowed: true,
                limit: rule.limit,
                total_hits: window.count,
                remaining: rule.limit - window.count,
                reset_at_ms: window.reset_at_ms,
                retry_after_secs: None,
            };

            let replace = match &most_restrictive {
                Some(current) => decision.remaining < current.remaining,
                None => true,
            };
            if replace {
                most_restrictive = Some(decision);
            }
        }

        drop(windows);
        *self.allowed.write().await += 1;

        most_restrictive.unwrap_or_else(RateLimitDecision::unlimited)
    }

    /// Drop windows whose reset time has passed. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, w| w.reset_at_ms > now);
        before - windows.len()
    }

    /// Remove a single window by its rendered key
    pub async fn reset_key(&self, key: &str) -> bool {
        let mut windows = self.windows.write().await;
        windows.remove(key).is_some()
    }

    /// Drop every window
    pub async fn reset_all(&self) {
        let mut windows = self.windows.write().await;
        windows.clear();
    }

    pub async fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_windows: self.windows.read().await.len(),
            total_allowed: *self.allowed.read().await,
            total_denied: *self.denied.read().await,
        }
    }

    /// Snapshot of active windows for the admin surface
    pub async fn window_snapshot(&self) -> Vec<WindowInfo> {
        let windows = self.windows.read().await;
        windows
            .iter()
            .map(|(k, w)| WindowInfo {
                key: k.clone(),
                count: w.count,
                started_at_ms: w.started_at_ms,
                reset_at_ms: w.reset_at_ms,
            })
            .collect()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn unauthenticated(subject: &RateSubject) -> bool {
    subject.user.is_none()
}

/// The base rules applied to all proxied traffic
pub fn base_rules(config: &RateLimitConfig) -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("global", "global", config.max_requests, config.window),
        RateLimitRule::new("per-ip", "ip:{ip}", 100, config.window),
        RateLimitRule::new("per-user", "user:{user}", 200, config.window)
            .with_skip(unauthenticated),
    ]
}

/// Endpoint-specific rules layered on top of the base rules
pub fn endpoint_rules(path: &str) -> Vec<RateLimitRule> {
    if path.starts_with("/api/v1/auth/login") {
        return vec![RateLimitRule::new(
            "login",
            "endpoint:{method}:{path}:{ip}",
            5,
            Duration::from_secs(300),
        )];
    }
    if path.starts_with("/api/v1/auth/register") {
        return vec![RateLimitRule::new(
            "register",
            "endpoint:{method}:{path}:{ip}",
            3,
            Duration::from_secs(300),
        )];
    }
    if path.starts_with("/api/users") {
        return vec![RateLimitRule::new(
            "users-endpoint",
            "endpoint:{method}:{path}",
            50,
            Duration::from_secs(60),
        )];
    }
    if path.starts_with("/api/orders") {
        return vec![RateLimitRule::new(
            "orders-endpoint",
            "endpoint:{method}:{path}",
            30,
            Duration::from_secs(60),
        )];
    }
    Vec::new()
}
