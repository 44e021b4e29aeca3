//! End-to-end tests over a Unix socket

use std::sync::Arc;
use std::time::Duration;

use clusterlink_identity::{IdentityConfig, IdentityLoader};
use clusterlink_proto::enforcer_cap_service_client::EnforcerCapServiceClient;
use clusterlink_proto::RpcVoid;
use clusterlink_transport::{
    CapabilityProbe, CapabilityResponder, ClientRegistry, CompressionProbe, GrpcServer, PeerRole,
    TransportConfig,
};
use tonic::transport::Channel;

#[tokio::test]
async fn test_unix_socket_needs_no_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("enforcer.sock");
    let socket_path = socket.to_str().expect("utf8 path").to_string();
    let config = TransportConfig {
        settle_window: Duration::from_millis(100),
        ..TransportConfig::default()
    };

    let mut server = GrpcServer::bind_unix(&socket, config.clone()).expect("server should bind");
    server.add_service(CapabilityResponder::default().enforcer_service());
    let handle = server.handle();
    let task = tokio::spawn(server.start());

    // The certificate directory is empty; Unix dials must not touch it
    let loader = Arc::new(IdentityLoader::new(IdentityConfig::with_dir(dir.path())));
    let registry = ClientRegistry::with_identity(loader.clone(), config.clone());

    let probe = CapabilityProbe::new(PeerRole::Enforcer, registry.dialer(), config.probe_timeout);
    assert!(probe.supports_compression(&socket_path).await);

    registry
        .register::<EnforcerCapServiceClient<Channel>>("enforcer", &socket_path, false)
        .await
        .expect("register");
    let mut stub: EnforcerCapServiceClient<Channel> = registry
        .acquire("enforcer", Some(&probe as &dyn CompressionProbe), None)
        .await
        .expect("acquire");
    let answer = stub
        .is_grpc_compressed(RpcVoid {})
        .await
        .expect("call over unix socket should succeed");
    assert!(answer.into_inner().value);
    assert!(!loader.is_loaded());

    registry.unregister("enforcer").await;
    handle.graceful_stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server should stop")
        .expect("server task")
        .expect("server should exit cleanly");
}

#[tokio::test]
async fn test_bind_on_existing_socket_path_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("taken.sock");
    let _first = GrpcServer::bind_unix(&socket, TransportConfig::default()).expect("first bind");

    let second = GrpcServer::bind_unix(&socket, TransportConfig::default());
    assert!(second.is_err());
}
