//! Outbound mTLS channels with observable connectivity
//!
//! tonic's `Channel` hides its connection state and cannot be closed while
//! clones are alive. [`Dialer`] owns the connector instead: every TCP+TLS
//! connection it hands to tonic publishes [`ConnectivityState`] transitions
//! into a watch channel and is cut off as soon as the [`NodeChannel`] is
//! closed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use svman_common::{CLIENT_KEEPALIVE_INTERVAL, CLIENT_KEEPALIVE_TIMEOUT};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, trace};

use crate::auth::{AttachSecret, SharedSecret};
use crate::mtls::{MtlsConfig, MtlsError};

/// Default bound on establishing a channel
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// A channel that attaches the shared secret to every request
pub type AuthenticatedChannel = InterceptedService<Channel, AttachSecret>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Address could not be turned into an endpoint
    #[error("invalid address '{address}': {message}")]
    InvalidAddress {
        /// Address as given
        address: String,
        /// Parse failure
        message: String,
    },

    /// Dial did not finish in time
    #[error("dial to {address} timed out after {timeout:?}")]
    Timeout {
        /// Address dialed
        address: String,
        /// Bound that expired
        timeout: Duration,
    },

    /// TCP, TLS or HTTP/2 setup failed
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address dialed
        address: String,
        /// Underlying transport error
        #[source]
        source: tonic::transport::Error,
    },

    /// Trust material unusable
    #[error(transparent)]
    Mtls(#[from] MtlsError),
}

/// Connection state of a [`NodeChannel`], as seen by its connector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No connection; the next request triggers a reconnect
    Idle,
    /// A connection attempt is in flight
    Connecting,
    /// Connected and TLS-authenticated
    Ready,
    /// The last connection attempt or connection failed
    TransientFailure,
    /// The channel was closed and will not reconnect
    Shutdown,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::TransientFailure => "transient_failure",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// State shared between a channel's handles and its connector
struct ChannelShared {
    state: watch::Sender<ConnectivityState>,
    closed: CancellationToken,
}

impl ChannelShared {
    fn new(initial: ConnectivityState) -> Arc<Self> {
        let (state, _) = watch::channel(initial);
        Arc::new(Self {
            state,
            closed: CancellationToken::new(),
        })
    }

    /// Move to `next` unless already shut down
    fn publish(&self, next: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == next {
                return false;
            }
            trace!(from = %current, to = %next, "connectivity changed");
            *current = next;
            true
        });
    }

    /// Move to `next` only from `expected`
    fn publish_from(&self, expected: ConnectivityState, next: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current != expected {
                return false;
            }
            trace!(from = %current, to = %next, "connectivity changed");
            *current = next;
            true
        });
    }
}

/// A live master↔slave channel
///
/// Cloning shares the underlying connection. [`close`](Self::close) cuts the
/// connection for every clone and stops reconnects.
#[derive(Clone)]
pub struct NodeChannel {
    channel: Channel,
    shared: Arc<ChannelShared>,
    attach: AttachSecret,
}

impl std::fmt::Debug for NodeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeChannel")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NodeChannel {
    /// Wrap a channel established by other means
    ///
    /// The channel starts out `Ready`. Connectivity is not tracked beyond
    /// that and [`close`](Self::close) only flips the state.
    pub fn from_channel(channel: Channel, secret: &SharedSecret) -> Self {
        Self {
            channel,
            shared: ChannelShared::new(ConnectivityState::Ready),
            attach: AttachSecret::new(secret),
        }
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    /// Subscribe to connectivity changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.shared.state.subscribe()
    }

    /// Whether [`close`](Self::close) has been called on any clone
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Not closed and not in a failed state
    pub fn is_usable(&self) -> bool {
        !self.is_closed()
            && !matches!(
                self.state(),
                ConnectivityState::TransientFailure | ConnectivityState::Shutdown
            )
    }

    /// Close the channel for every clone. Idempotent.
    pub fn close(&self) {
        self.shared.publish(ConnectivityState::Shutdown);
        self.shared.closed.cancel();
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Whether both handles share one underlying channel
    pub fn same_channel(&self, other: &NodeChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The channel with the shared secret attached, for generated clients
    pub fn authenticated(&self) -> AuthenticatedChannel {
        InterceptedService::new(self.channel.clone(), self.attach.clone())
    }
}

/// Dials peers under mTLS and produces [`NodeChannel`]s
#[derive(Clone)]
pub struct Dialer {
    tls: TlsConnector,
    server_name: ServerName<'static>,
    secret: SharedSecret,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("server_name", &self.server_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Build a dialer from trust material
    pub fn new(mtls: &MtlsConfig, secret: SharedSecret) -> Result<Self, MtlsError> {
        Ok(Self {
            tls: TlsConnector::from(mtls.client_config()?),
            server_name: mtls.server_name()?,
            secret,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Override the dial bound
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The dial bound
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect to `address` (`host:port`) and wait until the first
    /// connection is up
    pub async fn dial(&self, address: &str) -> Result<NodeChannel, TransportError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| TransportError::InvalidAddress {
                address: address.to_string(),
                message: e.to_string(),
            })?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(CLIENT_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(CLIENT_KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        let shared = ChannelShared::new(ConnectivityState::Idle);
        let connector = {
            let tls = self.tls.clone();
            let server_name = self.server_name.clone();
            let shared = shared.clone();
            tower::service_fn(move |uri: Uri| {
                connect_tls(uri, tls.clone(), server_name.clone(), shared.clone())
            })
        };

        debug!(address = %address, "dialing");
        let connected =
            tokio::time::timeout(self.connect_timeout, endpoint.connect_with_connector(connector))
                .await;

        match connected {
            Ok(Ok(channel)) => Ok(NodeChannel {
                channel,
                shared,
                attach: AttachSecret::new(&self.secret),
            }),
            Ok(Err(source)) => {
                shared.closed.cancel();
                Err(TransportError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                shared.closed.cancel();
                Err(TransportError::Timeout {
                    address: address.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "channel closed")
}

async fn connect_tls(
    uri: Uri,
    tls: TlsConnector,
    server_name: ServerName<'static>,
    shared: Arc<ChannelShared>,
) -> io::Result<TokioIo<TrackedStream<TlsStream<TcpStream>>>> {
    if shared.closed.is_cancelled() {
        return Err(aborted());
    }

    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address has no host"))?;
    let port = uri
        .port_u16()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address has no port"))?;

    shared.publish(ConnectivityState::Connecting);

    let attempt = async {
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        tls.connect(server_name, tcp).await
    };

    let result = tokio::select! {
        result = attempt => result,
        _ = shared.closed.cancelled() => Err(aborted()),
    };

    match result {
        Ok(stream) => {
            shared.publish(ConnectivityState::Ready);
            Ok(TokioIo::new(TrackedStream::new(stream, shared)))
        }
        Err(e) => {
            debug!(host = %host, port, error = %e, "connection attempt failed");
            shared.publish(ConnectivityState::TransientFailure);
            Err(e)
        }
    }
}

/// IO wrapper that reports connection loss and dies with its channel
struct TrackedStream<T> {
    inner: T,
    shared: Arc<ChannelShared>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<T> TrackedStream<T> {
    fn new(inner: T, shared: Arc<ChannelShared>) -> Self {
        let closed = Box::pin(shared.closed.clone().cancelled_owned());
        Self {
            inner,
            shared,
            closed,
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.closed.as_mut().poll(cx).is_ready()
    }

    fn on_error(&self) {
        self.shared.publish(ConnectivityState::TransientFailure);
    }
}

impl<T> Drop for TrackedStream<T> {
    fn drop(&mut self) {
        self.shared
            .publish_from(ConnectivityState::Ready, ConnectivityState::Idle);
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TrackedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(aborted()));
        }

        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if had_room && buf.filled().len() == before {
                    // EOF: peer went away cleanly
                    this.shared
                        .publish_from(ConnectivityState::Ready, ConnectivityState::Idle);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.on_error();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TrackedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            this.on_error();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            this.on_error();
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Err(_)) = &result {
            this.on_error();
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn lazy_channel() -> NodeChannel {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        NodeChannel::from_channel(channel, &SharedSecret::new("test"))
    }

    // =========================================================================
    // Connectivity publication
    // =========================================================================

    #[test]
    fn shutdown_is_terminal() {
        let shared = ChannelShared::new(ConnectivityState::Ready);
        shared.publish(ConnectivityState::Shutdown);
        shared.publish(ConnectivityState::Connecting);
        shared.publish_from(ConnectivityState::Ready, ConnectivityState::Idle);
        assert_eq!(*shared.state.borrow(), ConnectivityState::Shutdown);
    }

    #[test]
    fn publish_from_requires_expected_state() {
        let shared = ChannelShared::new(ConnectivityState::TransientFailure);
        shared.publish_from(ConnectivityState::Ready, ConnectivityState::Idle);
        assert_eq!(
            *shared.state.borrow(),
            ConnectivityState::TransientFailure
        );
    }

    #[tokio::test]
    async fn close_flips_every_clone() {
        let channel = lazy_channel();
        let clone = channel.clone();
        let mut rx = clone.watch_state();
        assert_eq!(channel.state(), ConnectivityState::Ready);
        assert!(channel.is_usable());

        channel.close();
        channel.close();

        assert!(clone.is_closed());
        assert!(!clone.is_usable());
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Shutdown);
        clone.closed().await;
    }

    #[tokio::test]
    async fn distinct_channels_are_not_the_same() {
        let a = lazy_channel();
        let b = lazy_channel();
        assert!(a.same_channel(&a.clone()));
        assert!(!a.same_channel(&b));
    }

    // =========================================================================
    // TrackedStream
    // =========================================================================

    #[tokio::test]
    async fn eof_moves_ready_to_idle() {
        let shared = ChannelShared::new(ConnectivityState::Ready);
        let (client, server) = tokio::io::duplex(64);
        let mut tracked = TrackedStream::new(client, shared.clone());

        drop(server);
        let mut buf = [0u8; 8];
        let n = tracked.read(&mut buf).await.expect("EOF is not an error");
        assert_eq!(n, 0);
        assert_eq!(*shared.state.borrow(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn drop_moves_ready_to_idle() {
        let shared = ChannelShared::new(ConnectivityState::Ready);
        let (client, _server) = tokio::io::duplex(64);
        drop(TrackedStream::new(client, shared.clone()));
        assert_eq!(*shared.state.borrow(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn cancellation_fails_pending_reads_and_writes() {
        let shared = ChannelShared::new(ConnectivityState::Ready);
        let (client, _server) = tokio::io::duplex(64);
        let mut tracked = TrackedStream::new(client, shared.clone());

        let canceller = shared.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceller.publish(ConnectivityState::Shutdown);
            canceller.closed.cancel();
        });

        let mut buf = [0u8; 8];
        let err = tracked
            .read(&mut buf)
            .await
            .expect_err("read must fail once closed");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        let err = tracked
            .write_all(b"ping")
            .await
            .expect_err("write must fail once closed");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(*shared.state.borrow(), ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn data_passes_through() {
        let shared = ChannelShared::new(ConnectivityState::Ready);
        let (client, mut server) = tokio::io::duplex(64);
        let mut tracked = TrackedStream::new(client, shared.clone());

        tracked.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");
        assert_eq!(*shared.state.borrow(), ConnectivityState::Ready);
    }

    // =========================================================================
    // Dialer
    // =========================================================================

    #[tokio::test]
    async fn dial_refused_port_fails() {
        use crate::pki::CertificateAuthority;

        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = ca
            .issue_node_cert("worker-1", "hypervisors", &["svman-node"])
            .expect("issuing should succeed");
        let mtls = MtlsConfig::from_pem(
            &node.cert_pem,
            &node.key_pem,
            ca.ca_cert_pem(),
            "hypervisors",
            "svman-node",
        )
        .expect("material should parse");

        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };

        let dialer = Dialer::new(&mtls, SharedSecret::new("s"))
            .expect("dialer")
            .with_connect_timeout(Duration::from_secs(5));
        let result = dialer.dial(&format!("127.0.0.1:{}", port)).await;
        assert!(matches!(
            result,
            Err(TransportError::Connect { .. }) | Err(TransportError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn dial_rejects_garbage_address() {
        use crate::pki::CertificateAuthority;

        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let node = ca
            .issue_node_cert("worker-1", "hypervisors", &["svman-node"])
            .expect("issuing should succeed");
        let mtls = MtlsConfig::from_pem(
            &node.cert_pem,
            &node.key_pem,
            ca.ca_cert_pem(),
            "hypervisors",
            "svman-node",
        )
        .expect("material should parse");

        let dialer = Dialer::new(&mtls, SharedSecret::new("s")).expect("dialer");
        let result = dialer.dial("not a uri at all").await;
        assert!(matches!(result, Err(TransportError::InvalidAddress { .. })));
    }
}
