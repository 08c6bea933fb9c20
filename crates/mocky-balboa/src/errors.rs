use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to control plane: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out waiting for handshake acknowledgement")]
    HandshakeTimeout,
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
    #[error("control connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for SSE connection")]
    SseConnectionTimeout,
}
