//! Master gRPC server
//!
//! Serves the `Registrar` service over mTLS with the shared secret required
//! on every call, and runs the health monitor alongside it.

use std::sync::Arc;

use svman_common::grpc_max_message_size;
use svman_infra::{
    require_secret, server_builder, tls_incoming, CertificateInfo, Dialer, MtlsConfig, MtlsError,
    SharedSecret,
};
use svman_proto::registrar_server::{Registrar, RegistrarServer};
use svman_proto::{Ack, HeartbeatRequest, RegisterRequest};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::config::MasterConfig;
use crate::health::{GrpcHeartbeatProbe, HealthMonitor, HeartbeatProbe};
use crate::registrar::{NodeDialer, NodeRegistrar, OnNodeRegistered};
use crate::registry::{NodeChannels, NodeEvent, NodeRegistry, RemovalReason, SharedNodeRegistry};

/// Master server failures
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// TLS material could not be turned into a config
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// Listener I/O failed
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    /// tonic server failed
    #[error("grpc server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// `Registrar` implementation backed by a [`NodeRegistrar`]
pub struct RegistrarService {
    registrar: Arc<NodeRegistrar>,
}

impl RegistrarService {
    /// Wrap `registrar`
    pub fn new(registrar: Arc<NodeRegistrar>) -> Self {
        Self { registrar }
    }

    /// Convert to a tonic service with the fleet message limits
    pub fn into_service(self) -> RegistrarServer<Self> {
        let max = grpc_max_message_size();
        RegistrarServer::new(self)
            .max_decoding_message_size(max)
            .max_encoding_message_size(max)
    }
}

/// Common name of the caller's leaf certificate, if any
fn peer_common_name<T>(request: &Request<T>) -> Option<String> {
    let certs = request.peer_certs()?;
    let leaf = certs.first()?;
    CertificateInfo::from_der(leaf.as_ref())
        .ok()
        .map(|info| info.common_name)
}

#[tonic::async_trait]
impl Registrar for RegistrarService {
    #[instrument(skip(self, request))]
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Ack>, Status> {
        let remote_addr = request.remote_addr();
        let peer = peer_common_name(&request);
        let RegisterRequest {
            address,
            machine_name,
        } = request.into_inner();

        info!(
            ?remote_addr,
            peer = ?peer,
            machine = %machine_name,
            address = %address,
            "registration request"
        );

        let entry = self
            .registrar
            .register(&address, &machine_name)
            .await
            .map_err(|e| {
                warn!(machine = %machine_name, error = %e, "registration failed");
                Status::from(e)
            })?;

        Ok(Response::new(Ack {
            ok: format!(
                "OK from master, {} registered at {}",
                entry.machine_name, entry.address
            ),
        }))
    }

    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Ack>, Status> {
        debug!(text = %request.get_ref().text, "heartbeat from slave");
        Ok(Response::new(Ack {
            ok: "OK from master".to_string(),
        }))
    }
}

/// Registrar, registry and health monitor wired together
pub struct MasterServer {
    registry: SharedNodeRegistry,
    registrar: Arc<NodeRegistrar>,
    monitor: HealthMonitor,
    server_tls: Arc<rustls::ServerConfig>,
    secret: SharedSecret,
}

impl MasterServer {
    /// Build a master from TLS material and the shared secret
    pub fn new(
        config: &MasterConfig,
        mtls: &MtlsConfig,
        secret: SharedSecret,
        hook: Option<Arc<dyn OnNodeRegistered>>,
    ) -> Result<Self, MasterError> {
        let dialer = Dialer::new(mtls, secret.clone())?.with_connect_timeout(config.dial_timeout);
        let server_tls = mtls.server_config()?;
        Ok(Self::from_parts(
            config,
            Arc::new(dialer),
            Arc::new(GrpcHeartbeatProbe),
            server_tls,
            secret,
            hook,
        ))
    }

    /// Build a master from explicit dialer and probe implementations
    pub fn from_parts(
        config: &MasterConfig,
        dialer: Arc<dyn NodeDialer>,
        probe: Arc<dyn HeartbeatProbe>,
        server_tls: Arc<rustls::ServerConfig>,
        secret: SharedSecret,
        hook: Option<Arc<dyn OnNodeRegistered>>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());

        let mut registrar = NodeRegistrar::new(registry.clone(), dialer, probe.clone())
            .with_probe_timeout(config.health.probe_timeout);
        if let Some(hook) = hook {
            registrar = registrar.with_hook(hook);
        }
        let registrar = Arc::new(registrar);

        let monitor = HealthMonitor::new(registry.clone(), probe, config.health.clone())
            .with_restore(registrar.clone());

        Self {
            registry,
            registrar,
            monitor,
            server_tls,
            secret,
        }
    }

    /// The node registry
    pub fn registry(&self) -> SharedNodeRegistry {
        self.registry.clone()
    }

    /// Channel lookup handle for feature subsystems
    pub fn node_channels(&self) -> Arc<dyn NodeChannels> {
        self.registry.clone()
    }

    /// Serve on `listener` until `shutdown` fires
    ///
    /// On return every registered channel has been closed.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), MasterError> {
        let addr = listener.local_addr()?;
        info!(%addr, "master listening");

        let tasks = CancellationToken::new();
        let monitor = tokio::spawn(self.monitor.clone().run(tasks.clone()));
        let events = tokio::spawn(log_events(self.registry.clone(), tasks.clone()));

        let service = require_secret(
            RegistrarService::new(self.registrar.clone()).into_service(),
            &self.secret,
        );
        let incoming = tls_incoming(listener, self.server_tls.clone(), shutdown.clone());

        let served = server_builder()
            .add_service(service)
            .serve_with_incoming_shutdown(incoming, shutdown.clone().cancelled_owned())
            .await;

        tasks.cancel();
        let _ = monitor.await;
        let _ = events.await;
        let closed = self.registry.close_all();
        info!(closed, "master stopped");

        served.map_err(MasterError::from)
    }
}

async fn log_events(registry: SharedNodeRegistry, shutdown: CancellationToken) {
    let mut events = registry.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(NodeEvent::Removed {
                address,
                machine_name,
                reason: RemovalReason::Unhealthy,
            }) => {
                warn!(machine = %machine_name, address = %address, "lost connection to slave");
            }
            Ok(event) => debug!(?event, "registry event"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "registry event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
