use std::net::SocketAddr;

use balboa_core::ControlPlaneError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    /// Bound on the `WEBSOCKET_SHOULD_PROXY_REQUEST` round trip; an
    /// unanswered question falls back to a genuine upstream relay.
    pub should_proxy_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], balboa_protocol::DEFAULT_PROXY_PORT)),
            should_proxy_timeout_ms: 1_000,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.should_proxy_timeout_ms == 0 {
            return Err(ControlPlaneError::InvalidConfig(
                "should_proxy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
