//! Outbound connections
//!
//! A [`Dialer`] turns an endpoint into a [`Connection`]: a lazily-connecting
//! tonic channel plus the [`ConnectivityTracker`] fed by its socket. No I/O
//! happens at dial time; the socket is opened by the first call, and a call
//! made while the peer is unreachable fails immediately instead of waiting.
//!
//! TCP endpoints are dialed with mutual TLS using the process identity. Unix
//! socket endpoints are dialed without TLS.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clusterlink_identity::{
    client_tls_config, install_crypto_provider, IdentityError, IdentityLoader,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, error};

use crate::carrier::Carrier;
use crate::codec::GrpcStub;
use crate::config::TransportConfig;
use crate::connectivity::{ConnectivityState, ConnectivityTracker, TrackedStream};
use crate::registry::ConnectionLost;

/// Dial errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Identity material could not be loaded
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The endpoint or TLS settings were rejected by the transport
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A channel plus the codec settings stubs built on it should use
#[derive(Clone, Debug)]
pub struct ClientChannel {
    channel: Channel,
    compress: bool,
    max_message_size: usize,
}

impl ClientChannel {
    /// Wrap a raw channel
    pub fn new(channel: Channel, compress: bool, max_message_size: usize) -> Self {
        Self {
            channel,
            compress,
            max_message_size,
        }
    }

    /// Build a stub of type `S` on this channel
    ///
    /// Responses are always accepted gzip-compressed. Requests are compressed
    /// only if the peer supports it.
    pub fn stub<S: GrpcStub>(&self) -> S {
        let stub = S::from_channel(self.channel.clone())
            .accept_gzip()
            .max_message_size(self.max_message_size);
        if self.compress {
            stub.send_gzip()
        } else {
            stub
        }
    }

    /// Underlying tonic channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Whether requests are compressed
    pub fn compress(&self) -> bool {
        self.compress
    }
}

/// One outbound connection
#[derive(Debug)]
pub struct Connection {
    channel: ClientChannel,
    tracker: ConnectivityTracker,
    closer: CancellationToken,
}

impl Connection {
    /// Assemble a connection from its parts
    ///
    /// `closer` must be the token the channel's sockets watch, so that
    /// [`Connection::close`] tears them down.
    pub fn new(channel: ClientChannel, tracker: ConnectivityTracker, closer: CancellationToken) -> Self {
        Self {
            channel,
            tracker,
            closer,
        }
    }

    /// Channel for building stubs
    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }

    /// Connectivity state of this connection
    pub fn tracker(&self) -> &ConnectivityTracker {
        &self.tracker
    }

    /// Close the connection
    ///
    /// Live sockets fail immediately and the channel refuses to reconnect,
    /// even for stubs cloned before the close.
    pub fn close(&self) {
        self.closer.cancel();
        self.tracker.shutdown();
    }
}

/// Live connection owned by a registry entry
///
/// Carries the watchdog cancellation token and the optional peer-lost
/// notification sender supplied when the connection was acquired.
#[derive(Debug)]
pub(crate) struct ClientHandle {
    pub(crate) id: u64,
    pub(crate) endpoint: String,
    pub(crate) connection: Connection,
    pub(crate) watchdog: CancellationToken,
    pub(crate) on_lost: Option<mpsc::Sender<ConnectionLost>>,
}

impl ClientHandle {
    /// Stop the watchdog and close the connection
    pub(crate) fn close(&self) {
        self.watchdog.cancel();
        self.connection.close();
    }
}

// =============================================================================
// Traits for Testability
// =============================================================================

/// Creates connections to endpoints
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `endpoint`, compressing requests if `compress` is set
    async fn dial(&self, endpoint: &str, compress: bool) -> Result<Connection, TransportError>;
}

/// Dialer for real TCP and Unix socket endpoints
pub struct GrpcDialer {
    identity: Arc<IdentityLoader>,
    config: TransportConfig,
}

impl GrpcDialer {
    /// Create a dialer using `identity` for TCP endpoints
    pub fn new(identity: Arc<IdentityLoader>, config: TransportConfig) -> Self {
        install_crypto_provider();
        Self { identity, config }
    }

    fn dial_tcp(&self, endpoint: &str, compress: bool) -> Result<Connection, TransportError> {
        let identity = self.identity.get()?;

        let channel_endpoint = Endpoint::from_shared(format!("https://{}", endpoint))?
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .tls_config(client_tls_config(&identity))?;

        let addr = endpoint.to_string();
        Ok(self.connect_lazy(channel_endpoint, compress, move || {
            let addr = addr.clone();
            async move {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        }))
    }

    fn dial_unix(&self, endpoint: &str, compress: bool) -> Result<Connection, TransportError> {
        // The URI is required by tonic but never resolved
        let channel_endpoint = Endpoint::from_static("http://localhost")
            .keep_alive_timeout(self.config.keepalive_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval);

        let path = PathBuf::from(endpoint);
        Ok(self.connect_lazy(channel_endpoint, compress, move || {
            UnixStream::connect(path.clone())
        }))
    }

    /// Lazy channel whose sockets come from `connect` and report liveness
    fn connect_lazy<F, Fut, S>(&self, endpoint: Endpoint, compress: bool, connect: F) -> Connection
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tracker = ConnectivityTracker::new();
        let closer = CancellationToken::new();
        let connect_timeout = self.config.connect_timeout;

        let connector = {
            let tracker = tracker.clone();
            let closer = closer.clone();
            tower::service_fn(move |_: Uri| {
                let tracker = tracker.clone();
                let closer = closer.clone();
                let connect = connect.clone();
                async move {
                    if closer.is_cancelled() {
                        return Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "connection closed",
                        ));
                    }

                    let attempt = tracker.begin_attempt();
                    let result = match tokio::time::timeout(connect_timeout, connect()).await {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                    };

                    match result {
                        Ok(stream) => Ok(TokioIo::new(TrackedStream::new(
                            stream, tracker, attempt, closer,
                        ))),
                        Err(e) => {
                            tracker.set_for(attempt, ConnectivityState::TransientFailure);
                            Err(e)
                        }
                    }
                }
            })
        };
        let channel = endpoint.connect_with_connector_lazy(connector);

        Connection::new(
            ClientChannel::new(channel, compress, self.config.max_message_size),
            tracker,
            closer,
        )
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, endpoint: &str, compress: bool) -> Result<Connection, TransportError> {
        let carrier = Carrier::of(endpoint);
        debug!(endpoint = %endpoint, %carrier, compress, "Dialing");

        let result = match carrier {
            Carrier::Tcp => self.dial_tcp(endpoint, compress),
            Carrier::Unix => self.dial_unix(endpoint, compress),
        };
        if let Err(e) = &result {
            error!(endpoint = %endpoint, error = %e, "Failed to dial");
        }
        result
    }
}
