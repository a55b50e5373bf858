use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when a single attempt exceeds its deadline
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when the request cannot be sent as built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The exchange was cut short (client went away or the body ended unexpectedly)
    #[error("Request canceled: {0}")]
    Canceled(String),
}

impl HttpClientError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, HttpClientError::Canceled(_))
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Connection level knobs of an upstream; requests sharing a profile share a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientProfile {
    pub connect_timeout: Duration,
    pub tls_skip_verify: bool,
    pub http2_only: bool,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tls_skip_verify: false,
            http2_only: false,
        }
    }
}

/// HttpClient defines the port (interface) for sending requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send one request using the connection pool for `profile`.
    ///
    /// No retries happen at this level; see the reverse-proxy transport.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        profile: ClientProfile,
    ) -> HttpClientResult<Response<AxumBody>>;
}
