//! gRPC server endpoint
//!
//! A [`GrpcServer`] binds its listener at construction and serves until
//! stopped. TCP servers terminate mutual TLS themselves so the caller's
//! certificate subjects can be attached to every request; Unix socket
//! servers run without TLS.
//!
//! # Accept loop
//!
//! Connections are accepted here and handed to tonic through a channel. If
//! accepting fails and the server has not been stopped, the failure is
//! logged and the accept loop restarts after the configured delay. Both
//! [`ServerHandle::stop`] and [`ServerHandle::graceful_stop`] end the loop,
//! including while a restart delay is pending.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use clusterlink_identity::{
    install_crypto_provider, server_tls_config, IdentityError, IdentityLoader,
};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::body::BoxBody;
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Status};
use tracing::{debug, error, info, warn};
use x509_parser::prelude::*;

use crate::codec::GzipCodec;
use crate::config::TransportConfig;

/// Accepted connections waiting for tonic
const ACCEPT_BACKLOG: usize = 128;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address or socket path
        address: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Identity material could not be loaded
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Accepting a connection failed
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The gRPC server exited with an error
    #[error("server error: {0}")]
    Serve(#[from] tonic::transport::Error),

    /// The gRPC server task panicked or was cancelled
    #[error("server task failed: {0}")]
    Task(String),
}

/// A bidirectional byte stream usable as a connection
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

// =============================================================================
// Traits for Testability
// =============================================================================

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next connection and describe its remote end
    async fn accept(&self) -> io::Result<(Box<dyn Io>, String)>;

    /// Address or path the listener is bound to
    fn local_addr(&self) -> String;
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<(Box<dyn Io>, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), remote.to_string()))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

struct UnixAcceptor {
    listener: UnixListener,
    path: String,
}

#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&self) -> io::Result<(Box<dyn Io>, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((Box::new(stream), self.path.clone()))
    }

    fn local_addr(&self) -> String {
        self.path.clone()
    }
}

/// Who is on the other end of an accepted connection
///
/// Available to services as a request extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Remote address, or the socket path for Unix connections
    pub remote: String,
    /// Subjects of the certificates the caller presented
    pub subjects: Vec<String>,
}

/// Accepted connection handed to tonic
struct AcceptedStream {
    io: Box<dyn Io>,
    peer: PeerIdentity,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl AcceptedStream {
    fn new(io: Box<dyn Io>, peer: PeerIdentity, closed: CancellationToken) -> Self {
        Self {
            io,
            peer,
            closed: Box::pin(closed.cancelled_owned()),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.closed.as_mut().poll(cx).is_ready() {
            return Some(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server stopped",
            ));
        }
        None
    }
}

impl AsyncRead for AcceptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for AcceptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connected for AcceptedStream {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.peer.clone()
    }
}

/// Subjects of the presented certificate chain, leaf first
fn peer_subjects(certs: Option<&[CertificateDer<'_>]>) -> Vec<String> {
    certs
        .unwrap_or_default()
        .iter()
        .filter_map(|der| X509Certificate::from_der(der.as_ref()).ok())
        .map(|(_, cert)| cert.subject().to_string())
        .collect()
}

/// Log the caller's certificate subjects; never rejects a call
fn log_peer_identity(request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(peer) = request.extensions().get::<PeerIdentity>() {
        info!(remote = %peer.remote, subjects = ?peer.subjects, "Peer certificate");
    }
    Ok(request)
}

/// Stop control for a running [`GrpcServer`]
#[derive(Clone, Debug, Default)]
pub struct ServerHandle {
    stopped: Arc<AtomicBool>,
    graceful: CancellationToken,
    hard: CancellationToken,
}

impl ServerHandle {
    /// Stop immediately, dropping open connections
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Stopping gRPC server");
        }
        self.hard.cancel();
    }

    /// Stop accepting and let in-flight calls finish
    ///
    /// Idempotent.
    pub fn graceful_stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Gracefully stopping gRPC server");
        }
        self.graceful.cancel();
    }

    /// Whether either stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn stopping(&self) {
        tokio::select! {
            _ = self.graceful.cancelled() => {}
            _ = self.hard.cancelled() => {}
        }
    }
}

/// gRPC server over TCP with mutual TLS, or over a Unix socket
pub struct GrpcServer {
    listener: Box<dyn Listener>,
    tls: Option<TlsAcceptor>,
    routes: RoutesBuilder,
    config: TransportConfig,
    handle: ServerHandle,
}

impl GrpcServer {
    /// Bind a TCP listener on `address` secured with the process identity
    pub async fn bind_tcp(
        address: &str,
        identity: &IdentityLoader,
        config: TransportConfig,
    ) -> Result<Self, ServerError> {
        install_crypto_provider();
        let identity = identity.get()?;
        let tls = server_tls_config(&identity, config.client_auth)?;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;

        let server = Self::with_listener(
            Box::new(TcpAcceptor { listener }),
            Some(Arc::new(tls)),
            config,
        );
        info!(
            address = %server.local_addr(),
            client_auth = ?server.config.client_auth,
            "gRPC server bound"
        );
        Ok(server)
    }

    /// Bind a Unix socket listener at `path`
    pub fn bind_unix(path: impl AsRef<Path>, config: TransportConfig) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
            address: path.display().to_string(),
            source,
        })?;

        let server = Self::with_listener(
            Box::new(UnixAcceptor {
                listener,
                path: path.display().to_string(),
            }),
            None,
            config,
        );
        info!(socket = %server.local_addr(), "gRPC server bound");
        Ok(server)
    }

    /// Serve connections from `listener`, terminating TLS if `tls` is set
    pub fn with_listener(
        listener: Box<dyn Listener>,
        tls: Option<Arc<rustls::ServerConfig>>,
        config: TransportConfig,
    ) -> Self {
        Self {
            listener,
            tls: tls.map(TlsAcceptor::from),
            routes: RoutesBuilder::default(),
            config,
            handle: ServerHandle::default(),
        }
    }

    /// Register a service with gzip and the configured message limits
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: GzipCodec
            + tower::Service<
                http::Request<BoxBody>,
                Response = http::Response<BoxBody>,
                Error = Infallible,
            > + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        debug!(service = S::NAME, "Registering gRPC service");
        self.routes
            .add_service(service.with_codec(self.config.max_message_size));
        self
    }

    /// Address or socket path being served
    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    /// Handle for stopping the server from elsewhere
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop immediately
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stop after in-flight calls finish
    pub fn graceful_stop(&self) {
        self.handle.graceful_stop();
    }

    /// Serve until stopped
    pub async fn start(self) -> Result<(), ServerError> {
        let GrpcServer {
            listener,
            tls,
            routes,
            config,
            handle,
        } = self;
        let address = listener.local_addr();

        let (tx, rx) = mpsc::channel::<AcceptedStream>(ACCEPT_BACKLOG);
        let incoming = ReceiverStream::new(rx).map(Ok::<_, io::Error>);
        let shutdown = {
            let handle = handle.clone();
            async move { handle.stopping().await }
        };
        let router = Server::builder()
            .layer(tonic::service::interceptor(log_peer_identity))
            .add_routes(routes.routes());
        let serve = tokio::spawn(router.serve_with_incoming_shutdown(incoming, shutdown));
        info!(address = %address, tls = tls.is_some(), "gRPC server started");

        let accept = Acceptor {
            listener: listener.as_ref(),
            tls: tls.as_ref(),
            handle: &handle,
            tx: &tx,
            handshake_timeout: config.connect_timeout,
        };
        loop {
            let Err(e) = accept.run().await else {
                break;
            };
            if handle.is_stopped() || serve.is_finished() {
                break;
            }

            error!(address = %address, error = %e, delay = ?config.restart_delay, "gRPC server failed, restarting");
            tokio::select! {
                _ = handle.stopping() => break,
                _ = tokio::time::sleep(config.restart_delay) => {}
            }
        }
        drop(tx);

        let result = match serve.await {
            Ok(result) => result.map_err(ServerError::from),
            Err(e) => Err(ServerError::Task(e.to_string())),
        };
        match &result {
            Ok(()) => info!(address = %address, "gRPC server stopped"),
            Err(e) => error!(address = %address, error = %e, "gRPC server exited"),
        }
        result
    }
}

/// One run of the accept loop
struct Acceptor<'a> {
    listener: &'a dyn Listener,
    tls: Option<&'a TlsAcceptor>,
    handle: &'a ServerHandle,
    tx: &'a mpsc::Sender<AcceptedStream>,
    handshake_timeout: Duration,
}

impl Acceptor<'_> {
    /// Accept until stopped, the server goes away, or accepting fails
    async fn run(&self) -> Result<(), ServerError> {
        loop {
            if self.tx.is_closed() {
                return Ok(());
            }

            let (io, remote) = tokio::select! {
                biased;
                _ = self.handle.stopping() => return Ok(()),
                accepted = self.listener.accept() => accepted.map_err(ServerError::Accept)?,
            };
            debug!(remote = %remote, "Accepted connection");

            let closed = self.handle.hard.clone();
            let Some(acceptor) = self.tls else {
                let peer = PeerIdentity {
                    remote,
                    subjects: Vec::new(),
                };
                if self.tx.send(AcceptedStream::new(io, peer, closed)).await.is_err() {
                    return Ok(());
                }
                continue;
            };

            // Handshakes run off the accept loop so a slow peer cannot stall it
            let acceptor = acceptor.clone();
            let tx = self.tx.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, acceptor.accept(io)).await {
                    Ok(Ok(stream)) => {
                        let peer = PeerIdentity {
                            subjects: peer_subjects(stream.get_ref().1.peer_certificates()),
                            remote,
                        };
                        let _ = tx.send(AcceptedStream::new(Box::new(stream), peer, closed)).await;
                    }
                    Ok(Err(e)) => warn!(remote = %remote, error = %e, "TLS handshake failed"),
                    Err(_) => warn!(remote = %remote, "TLS handshake timed out"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::CapabilityResponder;
    use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
    use clusterlink_proto::RpcVoid;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;
    use tonic::codec::CompressionEncoding;
    use tonic::transport::Endpoint;

    /// Listener failing its first `failures` accepts
    struct FlakyListener {
        inner: Option<TcpListener>,
        failures: usize,
        attempts: Arc<AtomicUsize>,
        failed: Arc<Notify>,
    }

    #[async_trait]
    impl Listener for FlakyListener {
        async fn accept(&self) -> io::Result<(Box<dyn Io>, String)> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                self.failed.notify_one();
                return Err(io::Error::other("transient accept failure"));
            }
            match &self.inner {
                Some(listener) => {
                    let (stream, remote) = listener.accept().await?;
                    Ok((Box::new(stream), remote.to_string()))
                }
                None => {
                    self.failed.notify_one();
                    Err(io::Error::other("permanent accept failure"))
                }
            }
        }

        fn local_addr(&self) -> String {
            self.inner
                .as_ref()
                .and_then(|l| l.local_addr().ok())
                .map(|a| a.to_string())
                .unwrap_or_else(|| "flaky".to_string())
        }
    }

    fn fast_restart() -> TransportConfig {
        TransportConfig {
            restart_delay: Duration::from_millis(20),
            ..TransportConfig::default()
        }
    }

    async fn ask(address: &str) -> bool {
        let channel = Endpoint::from_shared(format!("http://{}", address))
            .expect("endpoint")
            .connect()
            .await
            .expect("connect");
        let mut client = ControllerCapServiceClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);
        client
            .is_grpc_compressed(RpcVoid {})
            .await
            .expect("call should succeed")
            .into_inner()
            .value
    }

    #[tokio::test]
    async fn test_server_recovers_from_transient_accept_errors() {
        let inner = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = FlakyListener {
            inner: Some(inner),
            failures: 3,
            attempts: attempts.clone(),
            failed: Arc::new(Notify::new()),
        };

        let mut server = GrpcServer::with_listener(Box::new(listener), None, fast_restart());
        server.add_service(CapabilityResponder::default().controller_service());
        let address = server.local_addr();
        let handle = server.handle();
        let task = tokio::spawn(server.start());

        assert!(ask(&address).await);
        assert!(attempts.load(Ordering::SeqCst) >= 4);

        handle.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server should stop")
            .expect("server task");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_restart() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(Notify::new());
        let listener = FlakyListener {
            inner: None,
            failures: 0,
            attempts: attempts.clone(),
            failed: failed.clone(),
        };
        let config = TransportConfig {
            restart_delay: Duration::from_secs(3600),
            ..TransportConfig::default()
        };

        let server = GrpcServer::with_listener(Box::new(listener), None, config);
        let handle = server.handle();
        let task = tokio::spawn(server.start());

        failed.notified().await;
        handle.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server should stop during the restart delay")
            .expect("server task");
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_graceful_stop_marks_stopped_and_exits() {
        let inner = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let listener = FlakyListener {
            inner: Some(inner),
            failures: 0,
            attempts: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(Notify::new()),
        };

        let mut server = GrpcServer::with_listener(Box::new(listener), None, fast_restart());
        server.add_service(CapabilityResponder::default().controller_service());
        let address = server.local_addr();
        let handle = server.handle();
        let task = tokio::spawn(server.start());

        assert!(ask(&address).await);
        handle.graceful_stop();
        assert!(handle.is_stopped());

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server should stop")
            .expect("server task");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = ServerHandle::default();
        handle.stop();
        handle.stop();
        handle.graceful_stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_unix_bind_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("server.sock");

        let result = GrpcServer::bind_unix(&path, TransportConfig::default());
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_hard_stop_breaks_accepted_streams() {
        let closed = CancellationToken::new();
        let (local, mut remote) = tokio::io::duplex(64);
        let mut stream = AcceptedStream::new(Box::new(local), PeerIdentity::default(), closed.clone());

        remote.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read before stop");

        closed.cancel();
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_interceptor_never_rejects() {
        let mut request = Request::new(());
        assert!(log_peer_identity(Request::new(())).is_ok());

        request.extensions_mut().insert(PeerIdentity {
            remote: "10.0.0.5:4000".to_string(),
            subjects: vec!["CN=node".to_string()],
        });
        assert!(log_peer_identity(request).is_ok());
    }

    #[test]
    fn test_peer_subjects_without_certificates() {
        assert!(peer_subjects(None).is_empty());
    }
}
