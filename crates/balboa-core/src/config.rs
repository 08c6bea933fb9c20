use std::net::SocketAddr;

use crate::errors::ControlPlaneError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    pub bind: SocketAddr,
    /// Bound on the wait for the first (`IDENTIFY`) frame of a connection.
    pub handshake_timeout_ms: u64,
    /// Capacity of each subscription channel; slow consumers drop messages
    /// rather than stalling the connection's read loop.
    pub subscription_buffer: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], balboa_protocol::DEFAULT_CONTROL_PORT)),
            handshake_timeout_ms: 5_000,
            subscription_buffer: 1_024,
        }
    }
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ControlPlaneError::InvalidConfig(
                "handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(ControlPlaneError::InvalidConfig(
                "subscription_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptConfig {
    /// Bound on the wait for a correlated `RESPONSE` from the test process.
    pub response_timeout_ms: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5_000,
        }
    }
}

impl InterceptConfig {
    pub fn validate(&self) -> Result<(), ControlPlaneError> {
        if self.response_timeout_ms == 0 {
            return Err(ControlPlaneError::InvalidConfig(
                "response_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configs_validate() {
        ControlPlaneConfig::default().validate().expect("control");
        InterceptConfig::default().validate().expect("intercept");
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = ControlPlaneConfig {
            handshake_timeout_ms: 0,
            ..ControlPlaneConfig::default()
        };
        assert!(config.validate().is_err());

        let config = InterceptConfig {
            response_timeout_ms: 0,
        };
        assert!(config.validate().is_err());
    }
}
