use thiserror::Error;

/// Gateway error taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid or expired token")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No route found for {0}")]
    RouteNotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Upstream request timed out")]
    GatewayTimeout,

    #[error("Service temporarily unavailable")]
    ServiceUnavailable { retry_after_secs: u64 },

    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Cache error: {0}")]
    CacheError(#[from] CacheError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status code mapping for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::RouteNotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::BadGateway(_) => 502,
            GatewayError::GatewayTimeout => 504,
            GatewayError::ServiceUnavailable { .. } => 503,
            GatewayError::AuthError(e) => e.status_code(),
            GatewayError::CacheError(_) => 500,
            GatewayError::ConfigError(_) => 500,
            GatewayError::InternalError(_) => 500,
            GatewayError::IoError(_) => 500,
        }
    }

    /// Machine-readable kind used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::InvalidRequest(_) => "bad_request",
            GatewayError::RouteNotFound(_) => "not_found",
            GatewayError::RateLimited { .. } => "too_many_requests",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::GatewayTimeout => "gateway_timeout",
            GatewayError::ServiceUnavailable { .. } => "service_unavailable",
            GatewayError::AuthError(e) => e.kind(),
            _ => "internal_error",
        }
    }
}

/// Authentication and authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid or expired token")]
    InvalidOrExpired,

    #[error("Missing required claim: {0}")]
    MissingClaim(&'static str),

    #[error("Token is not a refresh token")]
    NotRefreshToken,

    #[error("Refresh subject does not match")]
    SubjectMismatch,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Access denied: {0}")]
    InsufficientPermissions(String),

    #[error("Authentication service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InsufficientPermissions(_) => 403,
            AuthError::UserExists(_) => 409,
            AuthError::ServiceUnavailable(_) => 500,
            _ => 401,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::InsufficientPermissions(_) => "forbidden",
            AuthError::UserExists(_) => "conflict",
            AuthError::ServiceUnavailable(_) => "internal_error",
            _ => "unauthorized",
        }
    }
}

/// Cache specific errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to store item in cache: {0}")]
    StoreError(String),

    #[error("Failed to retrieve item from cache: {0}")]
    RetrieveError(String),
}

/// Configuration specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid route definition: {0}")]
    InvalidRoute(String),
}
