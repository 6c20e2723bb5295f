use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::Method;
use tokio::sync::{oneshot, Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{self, error_response, TraceId};
use crate::auth::{TokenVerifier, UserStore};
use crate::balancer::LoadBalancer;
use crate::cache::ResponseCache;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{GatewayConfig, ServerConfig};
use crate::core::forwarder::Forwarder;
use crate::core::pipeline::RequestPipeline;
use crate::core::registry::RouteRegistry;
use crate::core::request::GatewayRequest;
use crate::core::response::GatewayResponse;
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::middleware::logging::LoggingMiddleware;
use crate::middleware::timing::TimingMiddleware;
use crate::middleware::{FinalHandler, MiddlewareChain, MiddlewareHandler};
use crate::rate_limit::{base_rules, RateLimiter};

/// Sweep cadence for expired windows, idle breakers and stale cache entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Idle breakers older than this are garbage-collected
const BREAKER_MAX_IDLE: Duration = Duration::from_secs(300);

/// Everything the handlers and the dispatch loop share
pub struct AppState {
    pub config: GatewayConfig,
    pub verifier: Arc<TokenVerifier>,
    pub users: Arc<UserStore>,
    pub registry: Arc<RouteRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub cache: Arc<ResponseCache>,
    pub balancer: Arc<LoadBalancer>,
    pub monitor: Arc<HealthMonitor>,
    pub handler: Arc<dyn MiddlewareHandler>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component together from configuration.
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let verifier = Arc::new(TokenVerifier::new(
            config.jwt.secret.clone(),
            config.jwt.expires_in,
            config.jwt.refresh_expires_in,
        ));
        let users = Arc::new(UserStore::new(config.argon2.clone()));
        let default_policy = config
            .balancer
            .algorithm
            .parse()
            .unwrap_or_else(|e| {
                warn!("{}; falling back to round-robin", e);
                Default::default()
            });
        let registry = Arc::new(RouteRegistry::new().with_default_policy(default_policy));
        let limiter = Arc::new(RateLimiter::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let cache = Arc::new(ResponseCache::new(
            config.cache.max_entries,
            config.cache.max_bytes,
            config.cache.default_ttl,
        ));
        let balancer = Arc::new(LoadBalancer::new());
        let monitor = Arc::new(HealthMonitor::new(registry.clone()));

        let gateway_id = format!("portcullis-{}", &Uuid::new_v4().to_string()[..8]);
        let forwarder = Arc::new(Forwarder::new(
            &config.forwarder,
            breakers.clone(),
            gateway_id,
        ));

        let pipeline = Arc::new(RequestPipeline::new(
            registry.clone(),
            limiter.clone(),
            cache.clone(),
            balancer.clone(),
            forwarder,
            verifier.clone(),
            breakers.clone(),
            base_rules(&config.rate_limit),
        ));

        let mut chain = MiddlewareChain::new();
        chain.add(LoggingMiddleware::detailed());
        chain.add(TimingMiddleware::default());
        let dispatch = pipeline.clone();
        let handler = chain.build(Arc::new(FinalHandler::new(move |request| {
            let pipeline = dispatch.clone();
            Box::pin(async move { Ok(pipeline.dispatch(request).await) })
        })));

        Arc::new(Self {
            config,
            verifier,
            users,
            registry,
            limiter,
            breakers,
            cache,
            balancer,
            monitor,
            handler,
            started_at: Instant::now(),
        })
    }

    /// Seed the demo routes and the mock admin account
    pub async fn seed_defaults(&self) -> Result<(), GatewayError> {
        self.registry.seed_demo_routes().await?;
        self.users
            .seed_admin(&self.config.admin_password)
            .await
            .map_err(GatewayError::AuthError)?;
        Ok(())
    }
}

struct ServerState {
    handle: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

/// The gateway server: HTTP listener, dispatch loop, periodic sweepers and
/// the health monitor, with graceful shutdown.
pub struct ApiGateway {
    state: Arc<AppState>,
    server: Mutex<ServerState>,
    sweeper_shutdown: Arc<RwLock<bool>>,
}

impl ApiGateway {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            server: Mutex::new(ServerState {
                handle: None,
                shutdown_tx: None,
                local_addr: None,
            }),
            sweeper_shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Bind and start serving. Returns the bound address (useful with
    /// port 0).
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let mut server = self.server.lock().await;
        if server.handle.is_some() {
            return Err(GatewayError::InternalError(
                "server is already running".to_string(),
            ));
        }

        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        )
        .parse()
        .map_err(|e| GatewayError::InternalError(format!("invalid listen address: {}", e)))?;

        let app = build_app(self.state.clone());
        let bound = axum::Server::try_bind(&addr)
            .map_err(|e| GatewayError::InternalError(format!("failed to bind {}: {}", addr, e)))?
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        let local_addr = bound.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = bound.with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("shutdown signal received, draining");
        });

        let handle = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!("server error: {}", e);
            }
        });

        server.handle = Some(handle);
        server.shutdown_tx = Some(shutdown_tx);
        server.local_addr = Some(local_addr);
        drop(server);

        self.spawn_sweepers();
        self.state.monitor.start().await;

        info!(%local_addr, "gateway listening");
        Ok(local_addr)
    }

    /// Stop the server, the sweepers and the health monitor
    pub async fn stop(&self) -> Result<(), GatewayError> {
        {
            let mut flag = self.sweeper_shutdown.write().await;
            *flag = true;
        }
        self.state.monitor.stop().await;

        let mut server = self.server.lock().await;
        let Some(handle) = server.handle.take() else {
            return Err(GatewayError::InternalError(
                "server is not running".to_string(),
            ));
        };

        if let Some(tx) = server.shutdown_tx.take() {
            let _ = tx.send(());
        }
        server.local_addr = None;
        drop(server);

        handle
            .await
            .map_err(|e| GatewayError::InternalError(format!("shutdown failed: {}", e)))?;
        info!("gateway stopped");
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.local_addr
    }

    fn spawn_sweepers(&self) {
        let limiter = self.state.limiter.clone();
        let breakers = self.state.breakers.clone();
        let cache = self.state.cache.clone();
        let shutdown = self.sweeper_shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                if *shutdown.read().await {
                    break;
                }

                let windows = limiter.sweep_expired().await;
                let idle = breakers.sweep_idle(BREAKER_MAX_IDLE).await;
                let entries = cache.sweep_expired().await;
                if windows + idle + entries > 0 {
                    info!(windows, idle, entries, "periodic sweep");
                }
            }
        });
    }
}

/// Assemble the axum application: built-in controllers, the proxy
/// fallback, and the cross-cutting layers.
pub fn build_app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    let cors = cors_layer(&state.config.server);

    Router::new()
        .route("/health", get(api::health::health))
        .route("/health/ready", get(api::health::ready))
        .route("/health/live", get(api::health::live))
        .nest("/api/v1/auth", api::auth::routes())
        .nest("/admin/gateway", api::admin::routes())
        .fallback(proxy_fallback)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
        .layer(cors)
        .layer(axum::middleware::from_fn(api::trace_and_secure))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            hyper::header::HeaderName::from_static("x-trace-id"),
            hyper::header::HeaderName::from_static("x-user-id"),
        ])
        .allow_credentials(true);

    match server.cors_origin.parse::<HeaderValue>() {
        Ok(origin) => layer = layer.allow_origin(origin),
        Err(_) => warn!(origin = %server.cors_origin, "invalid CORS origin, none allowed"),
    }
    layer
}

/// Catch-all: everything outside the built-in controllers is proxied
/// through the dispatch loop.
async fn proxy_fallback(
    Extension(state): Extension<Arc<AppState>>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match hyper::body::to_bytes(body).await {
        Ok(body) => body,
        Err(e) => {
            error!("failed to read request body: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &trace_id,
            );
        }
    };
    if body.len() > state.config.server.body_limit_bytes {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large",
            &trace_id,
        );
    }

    let gateway_request = GatewayRequest::new(
        parts.method,
        parts.uri,
        parts.headers,
        body,
        Some(remote),
        trace_id.clone(),
    );

    match state.handler.handle(gateway_request).await {
        Ok(response) => gateway_to_axum(response),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &e.to_string(), &trace_id)
        }
    }
}

fn gateway_to_axum(response: GatewayResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }

    builder
        .body(axum::body::boxed(Body::from(response.body)))
        .unwrap_or_else(|e| {
            error!("failed to build response: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::boxed(Body::empty()))
                .expect("empty response")
        })
}
