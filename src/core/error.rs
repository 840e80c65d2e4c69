use http::StatusCode;
use thiserror::Error;

/// Domain errors surfaced by the request path and the catalog.
///
/// Collaborators return these typed errors; the proxy core maps them to an
/// HTTP status at the edge via [`ProxyError::status_code`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// No routing rule matched the request
    #[error("no route matched the request")]
    RouteNotFound,

    /// The matched route references a service that does not exist
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Every server in the pool is marked unhealthy
    #[error("no healthy backends available")]
    NoHealthyBackends,

    /// Every healthy server is at its connection cap
    #[error("all backends reached their connection limit")]
    MaxConnectionsReached,

    /// The per-service circuit breaker is open
    #[error("circuit breaker is open for service {0}")]
    CircuitBreakerOpen(String),

    /// The client exceeded its token-bucket allowance
    #[error("rate limit exceeded for key {0}")]
    RateLimitExceeded(String),

    /// The upstream did not answer within the per-request timeout
    #[error("upstream request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The upstream refused or dropped the connection
    #[error("connection to upstream failed: {0}")]
    ConnectionRefused(String),

    /// The inbound request could not be turned into a valid upstream request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A server or service carries a weight the balancer cannot use
    #[error("invalid weight {weight} for {id}")]
    InvalidWeight { id: String, weight: i64 },

    /// Catalog create collided with an existing id
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Pluggable auth middleware rejected the request without credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Pluggable auth middleware rejected the credentials
    #[error("forbidden")]
    Forbidden,

    /// The catalog backend failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Anything else on the transport path
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProxyError {
    /// Whether a retry against another (or the same) backend may succeed.
    ///
    /// Circuit, capacity and rate-limit errors are terminal for the request:
    /// retrying them only amplifies pressure on an already-protected pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout(_) | ProxyError::ConnectionRefused(_)
        )
    }

    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyError::ServiceNotFound(_)
            | ProxyError::NoHealthyBackends
            | ProxyError::CircuitBreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::MaxConnectionsReached | ProxyError::RateLimitExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::InvalidWeight { .. }
            | ProxyError::AlreadyExists { .. }
            | ProxyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ConnectionRefused(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
