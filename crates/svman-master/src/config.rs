//! Master configuration

use std::net::SocketAddr;
use std::time::Duration;

use svman_common::{Error, Result, DEFAULT_MASTER_PORT};
use svman_infra::transport::DEFAULT_CONNECT_TIMEOUT;

use crate::health::HealthPolicy;

/// Settings for [`crate::MasterServer`]
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Where the registrar listens
    pub listen_addr: SocketAddr,
    /// Health monitor timing
    pub health: HealthPolicy,
    /// Bound on a dial-back to a registering slave
    pub dial_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_MASTER_PORT)),
            health: HealthPolicy::default(),
            dial_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl MasterConfig {
    /// Reject settings that would stall the monitor or dial-back
    pub fn validate(&self) -> Result<()> {
        if self.health.interval.is_zero() {
            return Err(Error::config("health.interval", "must be greater than zero"));
        }
        if self.health.probe_timeout.is_zero() {
            return Err(Error::config(
                "health.probe_timeout",
                "must be greater than zero",
            ));
        }
        if self.health.attempts == 0 {
            return Err(Error::config("health.attempts", "must be at least 1"));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::config("dial_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MasterConfig::default();
        assert_eq!(config.listen_addr.port(), 50051);
        assert_eq!(config.health.interval, Duration::from_secs(10));
        assert_eq!(config.dial_timeout, Duration::from_secs(60));
        config.validate().expect("defaults should validate");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = MasterConfig::default();
        config.health.interval = Duration::ZERO;
        let err = config.validate().expect_err("zero interval");
        assert!(err.to_string().contains("health.interval"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = MasterConfig::default();
        config.health.attempts = 0;
        assert!(config.validate().is_err());
    }
}
