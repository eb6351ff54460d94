//! Inbound mTLS for tonic servers
//!
//! tonic's built-in TLS cannot carry a custom client verifier, so the
//! handshake happens here and tonic serves the already-authenticated streams
//! through `serve_with_incoming`. A slow or rejected handshake never blocks
//! the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use svman_common::{SERVER_KEEPALIVE_INTERVAL, SERVER_KEEPALIVE_TIMEOUT};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, warn};

/// Bound on a single inbound TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of authenticated connections for `serve_with_incoming`
pub type TlsIncoming = ReceiverStream<io::Result<TlsStream<TcpStream>>>;

/// A tonic server builder with the fleet's keepalive settings
pub fn server_builder() -> Server {
    Server::builder()
        .tcp_nodelay(true)
        .http2_keepalive_interval(Some(SERVER_KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(SERVER_KEEPALIVE_TIMEOUT))
}

/// Accept connections on `listener` and complete mTLS handshakes
///
/// The stream ends once `shutdown` fires and in-flight handshakes finish.
pub fn tls_incoming(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> TlsIncoming {
    let acceptor = TlsAcceptor::from(config);
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer)) => {
                    let acceptor = acceptor.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(stream) = handshake(acceptor, tcp, peer).await {
                            let _ = tx.send(Ok(stream)).await;
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("accept loop stopped");
    });

    ReceiverStream::new(rx)
}

async fn handshake(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer: SocketAddr,
) -> Option<TlsStream<TcpStream>> {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => {
            debug!(peer = %peer, "TLS handshake complete");
            Some(stream)
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake rejected");
            None
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
            None
        }
    }
}
