use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures while waiting on a correlated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("timed out waiting for correlated reply")]
    TimedOut,
    #[error("connection closed before the correlated reply arrived")]
    ConnectionClosed,
}

/// Interception-layer failures. Every variant degrades the single outbound
/// call to a simulated network error; none of them crash the server under
/// test.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("timed out waiting for mock response to request {request_id}")]
    ResponseTimeout { request_id: String },
    #[error("test client reported a network error for request {request_id}")]
    MockedNetworkError { request_id: String },
    #[error("failed to read response body file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("mock response carried invalid status code {0}")]
    InvalidStatus(u16),
    #[error("control connection closed while sending request {request_id}")]
    ConnectionClosed { request_id: String },
}

#[derive(Debug, Error)]
pub enum MockableClientError {
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    #[error("invalid outbound request method: {0}")]
    InvalidRequest(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}
