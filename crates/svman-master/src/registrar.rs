//! Registration of slaves
//!
//! A slave announces the address of its command listener. The master dials
//! back to that address, confirms the channel with one heartbeat and only
//! then upserts the entry. All network I/O happens before the registry lock
//! is taken.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svman_common::{with_default_port, DEFAULT_SLAVE_PORT};
use svman_infra::{Dialer, NodeChannel, TransportError};
use tonic::Status;
use tracing::{info, instrument, warn};

use crate::health::{probe_with_timeout, HeartbeatError, HeartbeatProbe};
use crate::registry::{NodeEntry, RemovalReason, SharedNodeRegistry};

/// Default bound on the confirming heartbeat
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens master → slave channels
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeDialer: Send + Sync {
    /// Dial the command listener at `address`
    async fn dial(&self, address: &str) -> Result<NodeChannel, TransportError>;
}

#[async_trait]
impl NodeDialer for Dialer {
    async fn dial(&self, address: &str) -> Result<NodeChannel, TransportError> {
        Dialer::dial(self, address).await
    }
}

/// Hook run after a node is inserted
///
/// An error removes the node again and fails the registration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OnNodeRegistered: Send + Sync {
    /// Called with the freshly inserted entry
    async fn on_registered(&self, entry: &NodeEntry) -> Result<(), String>;
}

/// Registration failures
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Request fields were missing or malformed
    #[error("invalid registration: {0}")]
    InvalidArgument(String),

    /// Could not dial back to the slave
    #[error("dial-back to {address} failed: {source}")]
    Dial {
        /// Normalized listener address
        address: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Dialed, but the slave did not answer the confirming heartbeat
    #[error("initial heartbeat to {machine_name} failed: {source}")]
    Probe {
        /// Machine that was probed
        machine_name: String,
        /// Underlying heartbeat error
        #[source]
        source: HeartbeatError,
    },

    /// The registration hook refused the node
    #[error("registration of {machine_name} rejected: {reason}")]
    Rejected {
        /// Machine that was refused
        machine_name: String,
        /// Hook's reason
        reason: String,
    },
}

impl From<RegistrationError> for Status {
    fn from(err: RegistrationError) -> Self {
        match &err {
            RegistrationError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            RegistrationError::Dial { .. } | RegistrationError::Probe { .. } => {
                Status::unavailable(err.to_string())
            }
            RegistrationError::Rejected { .. } => Status::failed_precondition(err.to_string()),
        }
    }
}

/// Append the default slave port when `address` has none
pub fn normalize_address(address: &str) -> String {
    with_default_port(address, DEFAULT_SLAVE_PORT)
}

/// Dials, confirms and records slave registrations
pub struct NodeRegistrar {
    registry: SharedNodeRegistry,
    dialer: Arc<dyn NodeDialer>,
    probe: Arc<dyn HeartbeatProbe>,
    probe_timeout: Duration,
    hook: Option<Arc<dyn OnNodeRegistered>>,
}

impl NodeRegistrar {
    /// Create a registrar
    pub fn new(
        registry: SharedNodeRegistry,
        dialer: Arc<dyn NodeDialer>,
        probe: Arc<dyn HeartbeatProbe>,
    ) -> Self {
        Self {
            registry,
            dialer,
            probe,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            hook: None,
        }
    }

    /// Override the confirming heartbeat's timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Run `hook` after every successful insert
    pub fn with_hook(mut self, hook: Arc<dyn OnNodeRegistered>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The registry this registrar writes to
    pub fn registry(&self) -> &SharedNodeRegistry {
        &self.registry
    }

    /// Register the slave listening at `address` as `machine_name`
    ///
    /// Replays supersede the prior entry.
    #[instrument(skip(self))]
    pub async fn register(
        &self,
        address: &str,
        machine_name: &str,
    ) -> Result<NodeEntry, RegistrationError> {
        let machine_name = machine_name.trim();
        if machine_name.is_empty() {
            return Err(RegistrationError::InvalidArgument(
                "machine_name must not be empty".to_string(),
            ));
        }
        if address.trim().is_empty() {
            return Err(RegistrationError::InvalidArgument(
                "address must not be empty".to_string(),
            ));
        }
        let address = normalize_address(address);

        let channel = self
            .dialer
            .dial(&address)
            .await
            .map_err(|source| RegistrationError::Dial {
                address: address.clone(),
                source,
            })?;

        if let Err(source) =
            probe_with_timeout(self.probe.as_ref(), machine_name, &channel, self.probe_timeout)
                .await
        {
            channel.close();
            return Err(RegistrationError::Probe {
                machine_name: machine_name.to_string(),
                source,
            });
        }

        let mut entry = NodeEntry::new(&address, machine_name, channel);
        let upserted = self.registry.upsert(entry.clone());
        entry.generation = upserted.generation;

        if let Some(hook) = &self.hook {
            if let Err(reason) = hook.on_registered(&entry).await {
                warn!(machine = %machine_name, reason = %reason, "registration hook failed");
                self.registry.remove_if_current(
                    &address,
                    entry.generation,
                    RemovalReason::Rejected,
                );
                return Err(RegistrationError::Rejected {
                    machine_name: machine_name.to_string(),
                    reason,
                });
            }
        }

        info!(machine = %machine_name, address = %address, "slave connected");
        Ok(entry)
    }
}
