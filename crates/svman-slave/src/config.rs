//! Slave configuration

use std::net::SocketAddr;
use std::time::Duration;

use svman_common::{
    with_default_port, BackoffPolicy, Error, Result, DEFAULT_MASTER_PORT, DEFAULT_SLAVE_PORT,
};

/// Default time between slave → master heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on a single RPC to the master
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a single heartbeat
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a slave node
#[derive(Clone, Debug)]
pub struct SlaveConfig {
    /// Master registrar, `host[:port]`
    pub master_addr: String,
    /// Address the master should dial back to; the listener's bound address
    /// when unset
    pub advertise_addr: Option<String>,
    /// Logical name of this machine
    pub machine_name: String,
    /// Where the command listener binds
    pub listen_addr: SocketAddr,
    /// Time between heartbeats to the master
    pub heartbeat_interval: Duration,
    /// Bound on a single heartbeat
    pub heartbeat_timeout: Duration,
    /// Bound on dialing the master
    pub connect_timeout: Duration,
    /// Bound on the register call
    pub register_timeout: Duration,
    /// Retry pacing between sessions
    pub backoff: BackoffPolicy,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            master_addr: format!("127.0.0.1:{}", DEFAULT_MASTER_PORT),
            advertise_addr: None,
            machine_name: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SLAVE_PORT)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_RPC_TIMEOUT,
            register_timeout: DEFAULT_RPC_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SlaveConfig {
    /// Master address with the default master port filled in
    pub fn master_endpoint(&self) -> String {
        with_default_port(&self.master_addr, DEFAULT_MASTER_PORT)
    }

    /// Reject settings that would make the session loop misbehave
    pub fn validate(&self) -> Result<()> {
        Error::require_non_empty("master_addr", &self.master_addr)?;
        Error::require_non_empty("machine_name", &self.machine_name)?;
        if let Some(advertise) = &self.advertise_addr {
            Error::require_non_empty("advertise_addr", advertise)?;
        }
        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("connect_timeout", self.connect_timeout),
            ("register_timeout", self.register_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}
