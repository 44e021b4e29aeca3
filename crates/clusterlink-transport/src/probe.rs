//! Compression capability negotiation
//!
//! Peers predating compression support reject gzip-compressed requests. Before
//! opening a compressing channel to a peer of unknown revision, the registry
//! can ask it directly: dial with compression on, call its capability
//! service once, and close. Any failure means "not supported".

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
use clusterlink_proto::enforcer_cap_service_client::EnforcerCapServiceClient;
use clusterlink_proto::RpcVoid;
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, warn};

use crate::client::{ClientChannel, Dialer};

/// Role of the peer being probed
///
/// Each role serves the capability check under its own service name; the
/// negotiation is otherwise identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// Peer serves `share.ControllerCapService`
    Controller,
    /// Peer serves `share.EnforcerCapService`
    Enforcer,
}

impl PeerRole {
    /// Ask the peer on `channel` whether it supports compression
    async fn is_compressed(self, channel: &ClientChannel) -> Result<bool, Status> {
        let response = match self {
            PeerRole::Controller => {
                let mut stub: ControllerCapServiceClient<Channel> = channel.stub();
                stub.is_grpc_compressed(RpcVoid {}).await?
            }
            PeerRole::Enforcer => {
                let mut stub: EnforcerCapServiceClient<Channel> = channel.stub();
                stub.is_grpc_compressed(RpcVoid {}).await?
            }
        };
        Ok(response.into_inner().value)
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Controller => write!(f, "controller"),
            PeerRole::Enforcer => write!(f, "enforcer"),
        }
    }
}

impl FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(PeerRole::Controller),
            "enforcer" => Ok(PeerRole::Enforcer),
            other => Err(format!("unknown peer role: {}", other)),
        }
    }
}

// =============================================================================
// Traits for Testability
// =============================================================================

/// Decides whether requests to an endpoint may be compressed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompressionProbe: Send + Sync {
    /// Whether `endpoint` accepts compressed requests; never fails
    async fn supports_compression(&self, endpoint: &str) -> bool;
}

/// Probe that asks the peer's capability service
pub struct CapabilityProbe {
    role: PeerRole,
    dialer: Arc<dyn Dialer>,
    timeout: Duration,
}

impl CapabilityProbe {
    /// Probe peers of `role` over connections from `dialer`
    pub fn new(role: PeerRole, dialer: Arc<dyn Dialer>, timeout: Duration) -> Self {
        Self {
            role,
            dialer,
            timeout,
        }
    }
}

#[async_trait]
impl CompressionProbe for CapabilityProbe {
    async fn supports_compression(&self, endpoint: &str) -> bool {
        let connection = match self.dialer.dial(endpoint, true).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(endpoint = %endpoint, role = %self.role, error = %e, "Capability probe dial failed");
                return false;
            }
        };

        let answer =
            tokio::time::timeout(self.timeout, self.role.is_compressed(connection.channel())).await;
        connection.close();

        match answer {
            Ok(Ok(supported)) => {
                debug!(endpoint = %endpoint, role = %self.role, supported, "Capability probe answered");
                supported
            }
            Ok(Err(status)) => {
                warn!(endpoint = %endpoint, role = %self.role, error = %status, "Capability probe failed");
                false
            }
            Err(_) => {
                warn!(endpoint = %endpoint, role = %self.role, timeout = ?self.timeout, "Capability probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, MockDialer, TransportError};
    use crate::connectivity::ConnectivityTracker;
    use tokio_util::sync::CancellationToken;
    use tonic::transport::Endpoint;

    fn unreachable_connection(compress: bool) -> Connection {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        Connection::new(
            ClientChannel::new(channel, compress, 1024),
            ConnectivityTracker::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_role_parses() {
        assert_eq!("controller".parse::<PeerRole>(), Ok(PeerRole::Controller));
        assert_eq!("enforcer".parse::<PeerRole>(), Ok(PeerRole::Enforcer));
        assert!("scanner".parse::<PeerRole>().is_err());
        assert_eq!(PeerRole::Enforcer.to_string(), "enforcer");
    }

    #[tokio::test]
    async fn test_dial_failure_is_not_supported() {
        let mut dialer = MockDialer::new();
        dialer.expect_dial().times(1).returning(|_, _| {
            Err(TransportError::Identity(
                clusterlink_identity::IdentityError::Tls("no certs".to_string()),
            ))
        });

        let probe = CapabilityProbe::new(
            PeerRole::Controller,
            Arc::new(dialer),
            Duration::from_secs(1),
        );
        assert!(!probe.supports_compression("10.0.0.5:8080").await);
    }

    #[tokio::test]
    async fn test_dials_with_compression_and_fails_closed() {
        let mut dialer = MockDialer::new();
        dialer
            .expect_dial()
            .withf(|endpoint: &str, compress: &bool| endpoint == "127.0.0.1:1" && *compress)
            .times(1)
            .returning(|_, compress| Ok(unreachable_connection(compress)));

        let probe = CapabilityProbe::new(
            PeerRole::Enforcer,
            Arc::new(dialer),
            Duration::from_secs(5),
        );
        assert!(!probe.supports_compression("127.0.0.1:1").await);
    }
}
