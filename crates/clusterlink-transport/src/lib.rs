//! Connection lifecycle and pooling for cluster RPC
//!
//! Cluster processes talk to each other over gRPC, either across the network
//! with mutual TLS or over a local Unix socket. This crate owns everything
//! between "I have an address" and "I have a working stub":
//!
//! - [`GrpcServer`]: binds a listener, installs compression and message
//!   limits, logs caller identities, and restarts its accept loop on
//!   transient failure until stopped.
//! - [`GrpcDialer`]: builds lazily-connecting channels whose liveness is
//!   observable through a [`ConnectivityTracker`].
//! - [`CapabilityProbe`]: asks an older peer whether it accepts compressed
//!   payloads before committing to a compressing channel.
//! - [`Watchdog`]: turns connectivity transitions into a peer-lost verdict,
//!   debouncing transient failures.
//! - [`ClientRegistry`]: keyed pool of lazily-dialed connections with cached
//!   stubs, tearing entries down when their peer goes away.
//!
//! # Carrier selection
//!
//! An endpoint containing `:` is dialed over TCP with TLS; anything else is
//! treated as a Unix socket path and dialed without TLS (see [`Carrier`]).

pub mod carrier;
pub mod client;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod probe;
pub mod registry;
pub mod responder;
pub mod server;
pub mod watchdog;

pub use carrier::Carrier;
pub use client::{ClientChannel, Connection, Dialer, GrpcDialer, TransportError};
pub use codec::{GrpcStub, GzipCodec};
pub use config::TransportConfig;
pub use connectivity::{ConnectivityState, ConnectivityTracker, TrackedStream};
pub use probe::{CapabilityProbe, CompressionProbe, PeerRole};
pub use registry::{ClientRegistry, ConnectionEvent, ConnectionLost, RegistryError};
pub use responder::CapabilityResponder;
pub use server::{GrpcServer, Listener, PeerIdentity, ServerError, ServerHandle};
pub use watchdog::{Watchdog, WatchdogOutcome};
