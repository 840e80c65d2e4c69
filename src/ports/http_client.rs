use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

use crate::core::error::ProxyResult;

/// HttpClient defines the port (interface) for the upstream transport.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Perform one round-trip against the backend named in the request URI.
    ///
    /// Transport failures map to `ProxyError::ConnectionRefused` /
    /// `ProxyError::Timeout`; any response, including 5xx, is `Ok`.
    async fn forward(&self, req: Request<Body>) -> ProxyResult<Response<Body>>;

    /// Issue a health probe GET and return the response status code.
    ///
    /// Redirects are not followed; the caller decides what counts as a pass.
    async fn probe(&self, url: &str, timeout: Duration) -> ProxyResult<u16>;
}
