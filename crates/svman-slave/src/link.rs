//! RPCs from the slave to the master

use std::time::Duration;

use async_trait::async_trait;
use svman_common::grpc_max_message_size;
use svman_infra::{Dialer, NodeChannel, TransportError};
use svman_proto::registrar_client::RegistrarClient;
use svman_proto::{HeartbeatRequest, RegisterRequest};
use tonic::Status;
use tracing::debug;

/// Failures talking to the master
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Dial failed or timed out
    #[error(transparent)]
    Dial(#[from] TransportError),

    /// The master refused or failed the registration
    #[error("registration failed: {0}")]
    Register(Status),

    /// A heartbeat to the master failed
    #[error("heartbeat failed: {0}")]
    Heartbeat(Status),

    /// An RPC to the master did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// RPC that timed out
        operation: &'static str,
        /// The bound that was exceeded
        after: Duration,
    },
}

/// The slave's view of the master
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MasterLink: Send + Sync {
    /// Dial the master registrar
    async fn dial(&self) -> Result<NodeChannel, SessionError>;

    /// Announce this slave over `channel`
    async fn register(&self, channel: &NodeChannel) -> Result<(), SessionError>;

    /// Send one heartbeat over `channel`
    async fn heartbeat(&self, channel: &NodeChannel) -> Result<(), SessionError>;
}

/// [`MasterLink`] over the generated `Registrar` client
#[derive(Clone, Debug)]
pub struct GrpcMasterLink {
    dialer: Dialer,
    master_addr: String,
    advertise_addr: String,
    machine_name: String,
    register_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl GrpcMasterLink {
    /// Create a link that registers `machine_name` at `advertise_addr`
    pub fn new(
        dialer: Dialer,
        master_addr: impl Into<String>,
        advertise_addr: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            dialer,
            master_addr: master_addr.into(),
            advertise_addr: advertise_addr.into(),
            machine_name: machine_name.into(),
            register_timeout: crate::config::DEFAULT_RPC_TIMEOUT,
            heartbeat_timeout: crate::config::DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    /// Override the register and heartbeat bounds
    pub fn with_timeouts(mut self, register: Duration, heartbeat: Duration) -> Self {
        self.register_timeout = register;
        self.heartbeat_timeout = heartbeat;
        self
    }

    fn client(channel: &NodeChannel) -> RegistrarClient<svman_infra::AuthenticatedChannel> {
        let max = grpc_max_message_size();
        RegistrarClient::new(channel.authenticated())
            .max_decoding_message_size(max)
            .max_encoding_message_size(max)
    }
}

#[async_trait]
impl MasterLink for GrpcMasterLink {
    async fn dial(&self) -> Result<NodeChannel, SessionError> {
        Ok(self.dialer.dial(&self.master_addr).await?)
    }

    async fn register(&self, channel: &NodeChannel) -> Result<(), SessionError> {
        let mut client = Self::client(channel);
        let request = RegisterRequest {
            address: self.advertise_addr.clone(),
            machine_name: self.machine_name.clone(),
        };

        let ack = tokio::time::timeout(self.register_timeout, client.register(request))
            .await
            .map_err(|_| SessionError::Timeout {
                operation: "register",
                after: self.register_timeout,
            })?
            .map_err(SessionError::Register)?
            .into_inner();

        debug!(ack = %ack.ok, "registered with master");
        Ok(())
    }

    async fn heartbeat(&self, channel: &NodeChannel) -> Result<(), SessionError> {
        let mut client = Self::client(channel);
        let request = HeartbeatRequest {
            text: format!("ping from slave {}", self.machine_name),
        };

        tokio::time::timeout(self.heartbeat_timeout, client.heartbeat(request))
            .await
            .map_err(|_| SessionError::Timeout {
                operation: "heartbeat",
                after: self.heartbeat_timeout,
            })?
            .map_err(SessionError::Heartbeat)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_names_the_operation() {
        let err = SessionError::Timeout {
            operation: "register",
            after: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "register timed out after 60s");
    }

    #[test]
    fn dial_errors_pass_through() {
        let err = SessionError::from(TransportError::InvalidAddress {
            address: "nowhere".to_string(),
            message: "bad uri".to_string(),
        });
        assert!(matches!(err, SessionError::Dial(_)));
        assert!(err.to_string().contains("nowhere"));
    }
}
