//! Command listener
//!
//! The slave-side gRPC server the master dials back to. It serves
//! `CommandListener.Heartbeat` plus whatever feature services the caller
//! adds, all behind mTLS and the shared-secret check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use svman_common::grpc_max_message_size;
use svman_infra::{server_builder, tls_incoming, MtlsConfig, MtlsError, RequireSecret, SharedSecret};
use svman_proto::command_listener_server::{CommandListener, CommandListenerServer};
use svman_proto::{Ack, HeartbeatRequest};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::service::{interceptor, RoutesBuilder};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Command listener failures
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// TLS material could not be turned into a server config
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// The listener may only be started once per process
    #[error("command listener already started")]
    AlreadyStarted,

    /// Listener I/O failed
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    /// tonic server failed
    #[error("grpc server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

/// `CommandListener` implementation
#[derive(Clone, Debug, Default)]
pub struct CommandListenerService;

impl CommandListenerService {
    /// Convert to a tonic service with the fleet message limits
    pub fn into_service(self) -> CommandListenerServer<Self> {
        let max = grpc_max_message_size();
        CommandListenerServer::new(self)
            .max_decoding_message_size(max)
            .max_encoding_message_size(max)
    }
}

#[tonic::async_trait]
impl CommandListener for CommandListenerService {
    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> Result<Response<Ack>, Status> {
        debug!(text = %request.get_ref().text, "heartbeat from master");
        Ok(Response::new(Ack {
            ok: "OK from slave".to_string(),
        }))
    }
}

/// mTLS server for inbound master commands
pub struct CommandServer {
    server_tls: Arc<rustls::ServerConfig>,
    secret: SharedSecret,
    started: AtomicBool,
}

impl CommandServer {
    /// Build from trust material
    pub fn new(mtls: &MtlsConfig, secret: SharedSecret) -> Result<Self, ListenerError> {
        Ok(Self::from_tls(mtls.server_config()?, secret))
    }

    /// Build from a prepared rustls server config
    pub fn from_tls(server_tls: Arc<rustls::ServerConfig>, secret: SharedSecret) -> Self {
        Self {
            server_tls,
            secret,
            started: AtomicBool::new(false),
        }
    }

    /// Whether [`start`](Self::start) has already run
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start serving on `listener` in a background task
    ///
    /// `features` may add extra services next to `CommandListener`. Every
    /// service requires the shared secret. Only the first call starts a
    /// server; later calls fail with [`ListenerError::AlreadyStarted`].
    pub fn start<F>(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
        features: F,
    ) -> Result<JoinHandle<Result<(), ListenerError>>, ListenerError>
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("command listener start requested twice");
            return Err(ListenerError::AlreadyStarted);
        }

        let addr = listener.local_addr()?;
        let mut routes = RoutesBuilder::default();
        routes.add_service(CommandListenerService.into_service());
        features(&mut routes);
        let routes = routes.routes();

        let incoming = tls_incoming(listener, self.server_tls.clone(), shutdown.clone());
        let secret = RequireSecret::new(self.secret.clone());

        info!(%addr, "command listener started");
        Ok(tokio::spawn(async move {
            server_builder()
                .layer(interceptor(secret))
                .add_routes(routes)
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await?;
            info!(%addr, "command listener stopped");
            Ok::<(), ListenerError>(())
        }))
    }
}
