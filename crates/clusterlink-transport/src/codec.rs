//! Uniform compression and size-limit settings for generated gRPC types
//!
//! tonic generates the same builder methods on every client and server, but
//! with no trait tying them together. [`GrpcStub`] and [`GzipCodec`] provide
//! that trait so the registry and server can configure any generated type;
//! [`impl_grpc_client!`](crate::impl_grpc_client) and
//! [`impl_grpc_server!`](crate::impl_grpc_server) implement them.

use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
use clusterlink_proto::controller_cap_service_server::{
    ControllerCapService, ControllerCapServiceServer,
};
use clusterlink_proto::enforcer_cap_service_client::EnforcerCapServiceClient;
use clusterlink_proto::enforcer_cap_service_server::{
    EnforcerCapService, EnforcerCapServiceServer,
};
use tonic::transport::Channel;

#[doc(hidden)]
pub mod __private {
    pub use tonic::codec::CompressionEncoding;
    pub use tonic::transport::Channel;
}

/// A generated gRPC client that can be built over a [`Channel`]
pub trait GrpcStub: Clone + Send + Sync + 'static {
    /// Wrap `channel`
    fn from_channel(channel: Channel) -> Self;
    /// Compress outgoing requests with gzip
    fn send_gzip(self) -> Self;
    /// Accept gzip-compressed responses
    fn accept_gzip(self) -> Self;
    /// Limit both encoded and decoded message size
    fn max_message_size(self, limit: usize) -> Self;
}

/// A generated gRPC server whose codec can be configured
pub trait GzipCodec: Sized {
    /// Send and accept gzip, and limit message size in both directions
    fn with_codec(self, max_message_size: usize) -> Self;
}

/// Implement [`GrpcStub`] for generated client types over [`Channel`]
#[macro_export]
macro_rules! impl_grpc_client {
    ($($client:ty),+ $(,)?) => {
        $(
            impl $crate::codec::GrpcStub for $client {
                fn from_channel(channel: $crate::codec::__private::Channel) -> Self {
                    <$client>::new(channel)
                }

                fn send_gzip(self) -> Self {
                    self.send_compressed($crate::codec::__private::CompressionEncoding::Gzip)
                }

                fn accept_gzip(self) -> Self {
                    self.accept_compressed($crate::codec::__private::CompressionEncoding::Gzip)
                }

                fn max_message_size(self, limit: usize) -> Self {
                    self.max_decoding_message_size(limit)
                        .max_encoding_message_size(limit)
                }
            }
        )+
    };
}

/// Implement [`GzipCodec`] for generated server types
///
/// Takes `ServerType => ServiceTrait` pairs.
#[macro_export]
macro_rules! impl_grpc_server {
    ($($server:ident => $service:path),+ $(,)?) => {
        $(
            impl<T: $service> $crate::codec::GzipCodec for $server<T> {
                fn with_codec(self, max_message_size: usize) -> Self {
                    self.send_compressed($crate::codec::__private::CompressionEncoding::Gzip)
                        .accept_compressed($crate::codec::__private::CompressionEncoding::Gzip)
                        .max_decoding_message_size(max_message_size)
                        .max_encoding_message_size(max_message_size)
                }
            }
        )+
    };
}

impl_grpc_client!(
    ControllerCapServiceClient<Channel>,
    EnforcerCapServiceClient<Channel>,
);

impl_grpc_server!(
    ControllerCapServiceServer => ControllerCapService,
    EnforcerCapServiceServer => EnforcerCapService,
);
