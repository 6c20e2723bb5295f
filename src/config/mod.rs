use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::parse_duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Deployment environment (development, production)
    pub environment: String,

    /// Allowed CORS origin
    pub cors_origin: String,

    /// Maximum accepted request body size in bytes
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "development".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// JWT signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Process-wide HMAC signing secret
    pub secret: String,

    /// Access token lifetime
    pub expires_in: Duration,

    /// Refresh token lifetime
    pub refresh_expires_in: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "insecure-dev-secret".to_string(),
            expires_in: Duration::from_secs(3600),
            refresh_expires_in: Duration::from_secs(7 * 86_400),
        }
    }
}

/// Argon2id hashing costs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argon2Config {
    pub time_cost: u32,
    pub memory_cost_kib: u32,
    pub parallelism: u32,
}

impl Default for Argon2Config {
    fn default() -> Self {
        Self {
            time_cost: 2,
            memory_cost_kib: 65_536,
            parallelism: 1,
        }
    }
}

/// Base rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Base window length
    pub window: Duration,

    /// Global request budget per window
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 1000,
        }
    }
}

/// Default circuit breaker configuration applied to new routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window before the breaker opens
    pub threshold: u32,

    /// How long the breaker stays open before probing
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Default load balancer algorithm for new routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub algorithm: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: "round-robin".to_string(),
        }
    }
}

/// Health probing defaults for new routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(5_000),
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default entry TTL
    pub default_ttl: Duration,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum total body/header bytes retained
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Default per-request timeout
    pub request_timeout: Duration,

    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub argon2: Argon2Config,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub balancer: BalancerConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub forwarder: ForwarderConfig,

    /// Password for the seeded admin account of the mock user store
    pub admin_password: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = GatewayConfig::default();

        Self {
            server: ServerConfig {
                host: env_string("HOST", &defaults.server.host),
                port: env_or("PORT", defaults.server.port),
                environment: env_string("NODE_ENV", &defaults.server.environment),
                cors_origin: env_string("CORS_ORIGIN", &defaults.server.cors_origin),
                body_limit_bytes: defaults.server.body_limit_bytes,
            },
            jwt: JwtConfig {
                secret: env_string("JWT_SECRET", &defaults.jwt.secret),
                expires_in: env_duration("JWT_EXPIRES_IN", defaults.jwt.expires_in),
                refresh_expires_in: env_duration(
                    "JWT_REFRESH_EXPIRES_IN",
                    defaults.jwt.refresh_expires_in,
                ),
            },
            argon2: Argon2Config {
                time_cost: env_or("ARGON2_TIME_COST", defaults.argon2.time_cost),
                memory_cost_kib: env_or("ARGON2_MEMORY_COST", defaults.argon2.memory_cost_kib),
                parallelism: env_or("ARGON2_PARALLELISM", defaults.argon2.parallelism),
            },
            rate_limit: RateLimitConfig {
                window: env_duration("RATE_LIMIT_TTL", defaults.rate_limit.window),
                max_requests: env_or("RATE_LIMIT_MAX", defaults.rate_limit.max_requests),
            },
            breaker: BreakerConfig {
                threshold: env_or("CIRCUIT_BREAKER_THRESHOLD", defaults.breaker.threshold),
                open_timeout: std::env::var("CIRCUIT_BREAKER_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.breaker.open_timeout),
            },
            balancer: BalancerConfig {
                algorithm: env_string("LOAD_BALANCER_ALGORITHM", &defaults.balancer.algorithm),
            },
            health: HealthConfig {
                interval: std::env::var("HEALTH_CHECK_INTERVAL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.health.interval),
                timeout: std::env::var("HEALTH_CHECK_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.health.timeout),
            },
            cache: CacheConfig {
                default_ttl: env_duration("CACHE_TTL", defaults.cache.default_ttl),
                max_entries: env_or("CACHE_MAX_SIZE", defaults.cache.max_entries),
                max_bytes: defaults.cache.max_bytes,
            },
            forwarder: ForwarderConfig {
                request_timeout: std::env::var("REQUEST_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.forwarder.request_timeout),
                connect_timeout: std::env::var("CONNECTION_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.forwarder.connect_timeout),
            },
            admin_password: env_string("ADMIN_PASSWORD", "AdminPassw0rd!"),
        }
    }
}
