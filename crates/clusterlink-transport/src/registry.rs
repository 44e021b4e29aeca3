//! Keyed pool of lazily-dialed client connections
//!
//! Callers register a key with an endpoint and a stub constructor; nothing
//! is dialed until the first [`ClientRegistry::acquire`], which connects,
//! builds the stub and caches it. Each live connection gets a watchdog
//! task. When the watchdog decides the peer is gone, the entry's connection
//! and stub are cleared together (or the whole entry is removed if it was
//! registered with `auto_remove`), and the acquirer is notified.
//!
//! # Locking
//!
//! All entries sit behind one async mutex, held for the whole of every
//! operation, including the probe and dial inside `acquire`. Connection
//! setup for unrelated keys is therefore serialized; setup is rare compared
//! to stub use, which hits the cached fast path.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use clusterlink_identity::IdentityLoader;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::carrier::Carrier;
use crate::client::{ClientChannel, ClientHandle, Dialer, GrpcDialer, TransportError};
use crate::codec::GrpcStub;
use crate::config::TransportConfig;
use crate::connectivity::ConnectivityState;
use crate::probe::CompressionProbe;
use crate::watchdog::{Watchdog, WatchdogOutcome};

/// Buffer size for the registry event broadcast channel
const EVENT_CHANNEL_SIZE: usize = 64;

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The key is already registered
    #[error("client {0} already exists")]
    AlreadyExists(String),

    /// The key is not registered
    #[error("client {0} not found")]
    NotFound(String),

    /// The cached stub is not of the requested type
    #[error("client {key} does not hold a {expected}")]
    StubTypeMismatch {
        /// Registry key
        key: String,
        /// Requested stub type
        expected: &'static str,
    },

    /// Dialing the endpoint failed; the entry stays unconnected
    #[error("failed to connect client {key}: {source}")]
    Dial {
        /// Registry key
        key: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },
}

/// Sent to the acquirer when a connection's peer is lost
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionLost {
    /// Registry key
    pub key: String,
    /// Peer endpoint
    pub endpoint: String,
    /// State that proved the peer was gone
    pub state: ConnectivityState,
    /// Whether the entry was removed from the registry
    pub removed: bool,
}

/// Registry state changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was established for `key`
    Connected {
        /// Registry key
        key: String,
        /// Connection id
        id: u64,
    },
    /// The peer of connection `id` was lost
    Lost {
        /// Registry key
        key: String,
        /// Connection id
        id: u64,
        /// State that proved the peer was gone
        state: ConnectivityState,
    },
    /// The entry for `key` was removed
    Removed {
        /// Registry key
        key: String,
    },
}

type Stub = Arc<dyn Any + Send + Sync>;
type StubFactory = Arc<dyn Fn(&ClientChannel) -> Stub + Send + Sync>;

/// A live connection and the stub built on it; always set and cleared together
struct LiveConnection {
    handle: ClientHandle,
    stub: Stub,
}

/// Persistent registration for one key
struct PoolEntry {
    endpoint: String,
    auto_remove: bool,
    carrier: Carrier,
    factory: StubFactory,
    live: Option<LiveConnection>,
}

struct Inner {
    entries: Mutex<HashMap<String, PoolEntry>>,
    dialer: Arc<dyn Dialer>,
    next_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    settle_window: Duration,
}

/// Keyed pool of client connections
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<Inner>,
}

impl ClientRegistry {
    /// Create an empty registry dialing through `dialer`
    pub fn new(dialer: Arc<dyn Dialer>, config: &TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                dialer,
                next_id: AtomicU64::new(1),
                events,
                settle_window: config.settle_window,
            }),
        }
    }

    /// Create an empty registry dialing real endpoints with `identity`
    pub fn with_identity(identity: Arc<IdentityLoader>, config: TransportConfig) -> Self {
        let dialer = Arc::new(GrpcDialer::new(identity, config.clone()));
        Self::new(dialer, &config)
    }

    /// Dialer used for new connections
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        self.inner.dialer.clone()
    }

    /// Register `key` with a stub of generated client type `S`
    pub async fn register<S: GrpcStub>(
        &self,
        key: &str,
        endpoint: &str,
        auto_remove: bool,
    ) -> Result<(), RegistryError> {
        self.register_with(key, endpoint, auto_remove, |channel| channel.stub::<S>())
            .await
    }

    /// Register `key` with a custom stub constructor
    ///
    /// No I/O happens until the first [`ClientRegistry::acquire`].
    pub async fn register_with<S, F>(
        &self,
        key: &str,
        endpoint: &str,
        auto_remove: bool,
        constructor: F,
    ) -> Result<(), RegistryError>
    where
        S: Send + Sync + 'static,
        F: Fn(&ClientChannel) -> S + Send + Sync + 'static,
    {
        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(key) {
            return Err(RegistryError::AlreadyExists(key.to_string()));
        }

        let factory: StubFactory = Arc::new(move |channel| Arc::new(constructor(channel)) as Stub);
        entries.insert(
            key.to_string(),
            PoolEntry {
                endpoint: endpoint.to_string(),
                auto_remove,
                carrier: Carrier::of(endpoint),
                factory,
                live: None,
            },
        );
        debug!(key = %key, endpoint = %endpoint, auto_remove, "Registered client");
        Ok(())
    }

    /// Remove `key`, closing its connection; no-op if absent
    pub async fn unregister(&self, key: &str) {
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.remove(key) else {
            return;
        };
        if let Some(live) = entry.live {
            live.handle.close();
        }
        debug!(key = %key, endpoint = %entry.endpoint, "Unregistered client");
        let _ = self.inner.events.send(ConnectionEvent::Removed {
            key: key.to_string(),
        });
    }

    /// Get the stub for `key`, connecting first if needed
    ///
    /// With no live connection, `probe` (if given) decides whether requests
    /// are compressed; without a probe they are. `on_lost` is notified if
    /// the connection made by this call later loses its peer; the
    /// notification is dropped if the channel is full. Both are ignored
    /// when a live connection already exists.
    pub async fn acquire<S>(
        &self,
        key: &str,
        probe: Option<&dyn CompressionProbe>,
        on_lost: Option<mpsc::Sender<ConnectionLost>>,
    ) -> Result<S, RegistryError>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;

        if let Some(live) = &entry.live {
            return downcast(key, &live.stub);
        }

        let compress = match probe {
            Some(probe) => probe.supports_compression(&entry.endpoint).await,
            None => true,
        };
        debug!(key = %key, endpoint = %entry.endpoint, carrier = %entry.carrier, compress, "Connecting client");

        let connection = self
            .inner
            .dialer
            .dial(&entry.endpoint, compress)
            .await
            .map_err(|source| {
                error!(key = %key, endpoint = %entry.endpoint, error = %source, "Failed to connect client");
                RegistryError::Dial {
                    key: key.to_string(),
                    source,
                }
            })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::new(
            entry.endpoint.clone(),
            connection.tracker().subscribe(),
            cancel.clone(),
            self.inner.settle_window,
        );
        let stub = (entry.factory)(connection.channel());

        entry.live = Some(LiveConnection {
            handle: ClientHandle {
                id,
                endpoint: entry.endpoint.clone(),
                connection,
                watchdog: cancel,
                on_lost,
            },
            stub: stub.clone(),
        });
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            key.to_string(),
            id,
            watchdog,
        ));
        let _ = self.inner.events.send(ConnectionEvent::Connected {
            key: key.to_string(),
            id,
        });

        downcast(key, &stub)
    }

    /// Endpoint registered for `key`
    pub async fn endpoint_of(&self, key: &str) -> Option<String> {
        let entries = self.inner.entries.lock().await;
        entries.get(key).map(|entry| entry.endpoint.clone())
    }

    /// Whether `key` is registered
    pub async fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().await.contains_key(key)
    }

    /// Whether `key` has a live connection
    pub async fn is_connected(&self, key: &str) -> bool {
        let entries = self.inner.entries.lock().await;
        entries
            .get(key)
            .is_some_and(|entry| entry.live.is_some())
    }

    /// Number of registered keys
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Whether no keys are registered
    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    /// Registered keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Close every connection and remove every entry
    ///
    /// Peer-lost notifications are not sent.
    pub async fn shutdown(&self) {
        let mut entries = self.inner.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            if let Some(live) = entry.live {
                live.handle.close();
            }
        }
        info!(clients = count, "Client registry shut down");
    }
}

impl Inner {
    /// Tear down connection `id` of `key` after its peer was lost
    async fn handle_peer_lost(&self, key: &str, id: u64, state: ConnectivityState) {
        let notify = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            // A newer connection (or none) owns the entry now
            if entry.live.as_ref().map(|live| live.handle.id) != Some(id) {
                return;
            }
            let Some(live) = entry.live.take() else {
                return;
            };
            live.handle.close();

            let removed = entry.auto_remove;
            info!(key = %key, endpoint = %entry.endpoint, ?state, removed, "Peer lost, client closed");
            let _ = self.events.send(ConnectionEvent::Lost {
                key: key.to_string(),
                id,
                state,
            });
            if removed {
                entries.remove(key);
                let _ = self.events.send(ConnectionEvent::Removed {
                    key: key.to_string(),
                });
            }

            let ClientHandle {
                endpoint, on_lost, ..
            } = live.handle;
            on_lost.map(|tx| {
                (
                    tx,
                    ConnectionLost {
                        key: key.to_string(),
                        endpoint,
                        state,
                        removed,
                    },
                )
            })
        };

        if let Some((tx, lost)) = notify {
            match tx.try_send(lost) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(lost)) => {
                    warn!(key = %lost.key, endpoint = %lost.endpoint, "Peer lost notification dropped, receiver is full");
                }
            }
        }
    }
}

/// Watchdog task for connection `id` of `key`
async fn supervise(inner: Weak<Inner>, key: String, id: u64, watchdog: Watchdog) {
    match watchdog.run().await {
        WatchdogOutcome::Cancelled => {}
        WatchdogOutcome::PeerLost(state) => {
            if let Some(inner) = inner.upgrade() {
                inner.handle_peer_lost(&key, id, state).await;
            }
        }
    }
}

fn downcast<S: Clone + 'static>(key: &str, stub: &Stub) -> Result<S, RegistryError> {
    stub.downcast_ref::<S>()
        .cloned()
        .ok_or_else(|| RegistryError::StubTypeMismatch {
            key: key.to_string(),
            expected: type_name::<S>(),
        })
}
