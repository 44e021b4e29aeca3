//! Protocol buffer definitions for cluster peer capability checks.
//!
//! Peers of different releases disagree on whether gRPC payloads may be
//! gzip-compressed. Before opening a long-lived channel, a client may ask the
//! remote side through one of two capability services:
//!
//! - [`controller_cap_service_client::ControllerCapServiceClient`] when the
//!   peer is a controller
//! - [`enforcer_cap_service_client::EnforcerCapServiceClient`] when the peer
//!   is an enforcer
//!
//! Both expose the same single call, `IsGRPCCompressed`, which takes an
//! [`RpcVoid`] and answers with a [`ClusBoolean`].
//!
//! # Wire compatibility
//!
//! The proto package is `share` and the service and method names match the
//! ones already deployed, so `/share.ControllerCapService/IsGRPCCompressed`
//! resolves on older peers too. A peer that predates the service answers
//! `Unimplemented`, which callers treat as "not supported".
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
//! use clusterlink_proto::RpcVoid;
//!
//! let mut client = ControllerCapServiceClient::new(channel);
//! let answer = client.is_grpc_compressed(RpcVoid {}).await?.into_inner();
//! println!("compression supported: {}", answer.value);
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from capability.proto
pub mod share {
    tonic::include_proto!("share");
}

pub use share::*;

/// Fully qualified name of the controller capability service
pub const CONTROLLER_CAP_SERVICE: &str = "share.ControllerCapService";

/// Fully qualified name of the enforcer capability service
pub const ENFORCER_CAP_SERVICE: &str = "share.EnforcerCapService";

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::server::NamedService;

    #[test]
    fn test_service_names_match_wire_contract() {
        assert_eq!(
            <controller_cap_service_server::ControllerCapServiceServer<Noop> as NamedService>::NAME,
            CONTROLLER_CAP_SERVICE
        );
        assert_eq!(
            <enforcer_cap_service_server::EnforcerCapServiceServer<Noop> as NamedService>::NAME,
            ENFORCER_CAP_SERVICE
        );
    }

    #[test]
    fn test_boolean_defaults_to_false() {
        assert!(!ClusBoolean::default().value);
    }

    struct Noop;

    #[tonic::async_trait]
    impl controller_cap_service_server::ControllerCapService for Noop {
        async fn is_grpc_compressed(
            &self,
            _request: tonic::Request<RpcVoid>,
        ) -> Result<tonic::Response<ClusBoolean>, tonic::Status> {
            Ok(tonic::Response::new(ClusBoolean { value: true }))
        }
    }

    #[tonic::async_trait]
    impl enforcer_cap_service_server::EnforcerCapService for Noop {
        async fn is_grpc_compressed(
            &self,
            _request: tonic::Request<RpcVoid>,
        ) -> Result<tonic::Response<ClusBoolean>, tonic::Status> {
            Ok(tonic::Response::new(ClusBoolean { value: true }))
        }
    }
}
