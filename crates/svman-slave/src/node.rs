//! A complete slave: command listener plus master session

use std::sync::Arc;

use svman_infra::{Dialer, MtlsConfig, SharedSecret};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tracing::{info, warn};

use crate::config::SlaveConfig;
use crate::link::{GrpcMasterLink, MasterLink};
use crate::listener::{CommandServer, ListenerError};
use crate::session::Session;

/// Listener and session for one slave process
pub struct SlaveNode {
    config: SlaveConfig,
    server: CommandServer,
    dialer: Dialer,
}

impl SlaveNode {
    /// Build a slave from trust material
    pub fn new(
        config: SlaveConfig,
        mtls: &MtlsConfig,
        secret: SharedSecret,
    ) -> Result<Self, ListenerError> {
        let server = CommandServer::new(mtls, secret.clone())?;
        let dialer = Dialer::new(mtls, secret)?.with_connect_timeout(config.connect_timeout);
        Ok(Self {
            config,
            server,
            dialer,
        })
    }

    /// Serve commands on `listener` and keep a session with the master until
    /// `shutdown` fires
    ///
    /// `features` may add services to the command listener. When no
    /// advertise address is configured the listener's bound address is
    /// announced.
    pub async fn run<F>(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
        features: F,
    ) -> Result<(), ListenerError>
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        let bound = listener.local_addr()?;
        let advertise = match &self.config.advertise_addr {
            Some(addr) => addr.clone(),
            None => {
                if bound.ip().is_unspecified() {
                    warn!(%bound, "advertising an unspecified address; set an advertise address");
                }
                bound.to_string()
            }
        };

        let listener_task = self.server.start(listener, shutdown.clone(), features)?;

        let link: Arc<dyn MasterLink> = Arc::new(
            GrpcMasterLink::new(
                self.dialer.clone(),
                self.config.master_endpoint(),
                advertise.clone(),
                self.config.machine_name.clone(),
            )
            .with_timeouts(self.config.register_timeout, self.config.heartbeat_timeout),
        );
        let session = Session::new(
            link,
            self.config.heartbeat_interval,
            self.config.backoff.clone(),
        );

        info!(
            machine = %self.config.machine_name,
            master = %self.config.master_endpoint(),
            advertise = %advertise,
            "slave starting"
        );
        session.run(shutdown.clone()).await;

        shutdown.cancel();
        match listener_task.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "command listener task failed");
                Ok(())
            }
        }
    }
}
