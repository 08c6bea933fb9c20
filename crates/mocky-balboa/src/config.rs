#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Control-plane WebSocket URL on the server under test.
    pub control_url: String,
    pub handshake_timeout_ms: u64,
    /// Bound on waits for per-message acknowledgements.
    pub ack_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_url: format!("ws://127.0.0.1:{}", balboa_protocol::DEFAULT_CONTROL_PORT),
            handshake_timeout_ms: 5_000,
            ack_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn with_control_url(url: impl Into<String>) -> Self {
        Self {
            control_url: url.into(),
            ..Self::default()
        }
    }
}
