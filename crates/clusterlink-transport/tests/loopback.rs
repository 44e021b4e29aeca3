//! End-to-end tests over loopback TCP with mutual TLS

use std::sync::Arc;
use std::time::Duration;

use clusterlink_identity::pki::{write_cert_set, CertificateAuthority};
use clusterlink_identity::{ClientAuthPolicy, IdentityConfig, IdentityLoader};
use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
use clusterlink_proto::controller_cap_service_server::{
    ControllerCapService, ControllerCapServiceServer,
};
use clusterlink_proto::{ClusBoolean, RpcVoid};
use clusterlink_transport::{
    CapabilityProbe, CapabilityResponder, ClientRegistry, CompressionProbe, GrpcServer,
    PeerIdentity, PeerRole, ServerError, ServerHandle, TransportConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status};

const PEER_NAME: &str = "clusterlink-test";

struct TestCerts {
    dir: tempfile::TempDir,
    loader: Arc<IdentityLoader>,
}

fn test_certs() -> TestCerts {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
    write_cert_set(&ca, PEER_NAME, dir.path()).expect("write cert set");
    let loader = Arc::new(IdentityLoader::new(IdentityConfig::with_dir(dir.path())));
    TestCerts { dir, loader }
}

fn test_config() -> TransportConfig {
    TransportConfig {
        settle_window: Duration::from_millis(100),
        restart_delay: Duration::from_millis(50),
        probe_timeout: Duration::from_secs(5),
        ..TransportConfig::default()
    }
}

async fn start_server(
    certs: &TestCerts,
    config: TransportConfig,
    responder: CapabilityResponder,
) -> (String, ServerHandle, JoinHandle<Result<(), ServerError>>) {
    let mut server = GrpcServer::bind_tcp("127.0.0.1:0", &certs.loader, config)
        .await
        .expect("server should bind");
    server
        .add_service(responder.controller_service())
        .add_service(responder.enforcer_service());

    let address = server.local_addr();
    let handle = server.handle();
    (address, handle, tokio::spawn(server.start()))
}

async fn stop(handle: ServerHandle, task: JoinHandle<Result<(), ServerError>>) {
    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server should stop")
        .expect("server task")
        .expect("server should exit cleanly");
}

#[tokio::test]
async fn test_registry_round_trip_over_mtls() {
    let certs = test_certs();
    let config = test_config();
    let (address, handle, task) =
        start_server(&certs, config.clone(), CapabilityResponder::default()).await;

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    registry
        .register::<ControllerCapServiceClient<Channel>>("controller", &address, false)
        .await
        .expect("register");

    let probe = CapabilityProbe::new(PeerRole::Controller, registry.dialer(), config.probe_timeout);
    let mut stub: ControllerCapServiceClient<Channel> = registry
        .acquire("controller", Some(&probe as &dyn CompressionProbe), None)
        .await
        .expect("acquire");

    let answer = stub
        .is_grpc_compressed(RpcVoid {})
        .await
        .expect("call over mTLS should succeed");
    assert!(answer.into_inner().value);
    assert!(registry.is_connected("controller").await);

    registry.shutdown().await;
    stop(handle, task).await;
}

#[tokio::test]
async fn test_probe_reports_legacy_peer() {
    let certs = test_certs();
    let config = test_config();
    let (address, handle, task) =
        start_server(&certs, config.clone(), CapabilityResponder::new(false)).await;

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    let probe = CapabilityProbe::new(PeerRole::Enforcer, registry.dialer(), config.probe_timeout);
    assert!(!probe.supports_compression(&address).await);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_probe_unreachable_peer_fails_closed() {
    let certs = test_certs();
    let config = test_config();

    let unused = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = unused.local_addr().expect("addr").to_string();
    drop(unused);

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    let probe = CapabilityProbe::new(PeerRole::Controller, registry.dialer(), config.probe_timeout);
    assert!(!probe.supports_compression(&address).await);
}

/// Capability service that never answers in time
struct Stalled;

#[tonic::async_trait]
impl ControllerCapService for Stalled {
    async fn is_grpc_compressed(
        &self,
        _request: Request<RpcVoid>,
    ) -> Result<Response<ClusBoolean>, Status> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(Response::new(ClusBoolean { value: true }))
    }
}

#[tokio::test]
async fn test_probe_timeout_fails_closed() {
    let certs = test_certs();
    let config = test_config();
    let mut server = GrpcServer::bind_tcp("127.0.0.1:0", &certs.loader, config.clone())
        .await
        .expect("server should bind");
    server.add_service(ControllerCapServiceServer::new(Stalled));
    let address = server.local_addr();
    let handle = server.handle();
    let task = tokio::spawn(server.start());

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    let probe = CapabilityProbe::new(
        PeerRole::Controller,
        registry.dialer(),
        Duration::from_millis(300),
    );
    assert!(!probe.supports_compression(&address).await);

    stop(handle, task).await;
}

/// Capability service reporting the caller identity it was handed
struct CallerRecorder {
    seen: mpsc::Sender<Option<PeerIdentity>>,
}

#[tonic::async_trait]
impl ControllerCapService for CallerRecorder {
    async fn is_grpc_compressed(
        &self,
        request: Request<RpcVoid>,
    ) -> Result<Response<ClusBoolean>, Status> {
        let caller = request.extensions().get::<PeerIdentity>().cloned();
        let _ = self.seen.send(caller).await;
        Ok(Response::new(ClusBoolean { value: true }))
    }
}

#[tokio::test]
async fn test_service_sees_client_certificate_subjects() {
    let certs = test_certs();
    let config = test_config();
    let (seen_tx, mut seen_rx) = mpsc::channel(1);
    let mut server = GrpcServer::bind_tcp("127.0.0.1:0", &certs.loader, config.clone())
        .await
        .expect("server should bind");
    server.add_service(ControllerCapServiceServer::new(CallerRecorder { seen: seen_tx }));
    let address = server.local_addr();
    let handle = server.handle();
    let task = tokio::spawn(server.start());

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config);
    registry
        .register::<ControllerCapServiceClient<Channel>>("controller", &address, false)
        .await
        .expect("register");
    let mut stub: ControllerCapServiceClient<Channel> = registry
        .acquire("controller", None, None)
        .await
        .expect("acquire");
    stub.is_grpc_compressed(RpcVoid {})
        .await
        .expect("call over mTLS should succeed");

    let caller = seen_rx
        .recv()
        .await
        .expect("service should be called")
        .expect("caller identity should be attached");
    assert_eq!(caller.subjects, vec![format!("CN={}", PEER_NAME)]);
    assert!(caller.remote.starts_with("127.0.0.1:"));

    registry.shutdown().await;
    stop(handle, task).await;
}

#[tokio::test]
async fn test_server_stop_triggers_peer_lost() {
    let certs = test_certs();
    let config = test_config();
    let (address, handle, task) =
        start_server(&certs, config.clone(), CapabilityResponder::default()).await;

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    registry
        .register::<ControllerCapServiceClient<Channel>>("controller", &address, true)
        .await
        .expect("register");

    let (tx, mut rx) = mpsc::channel(4);
    let mut stub: ControllerCapServiceClient<Channel> = registry
        .acquire("controller", None, Some(tx))
        .await
        .expect("acquire");
    stub.is_grpc_compressed(RpcVoid {})
        .await
        .expect("call should succeed");

    stop(handle, task).await;

    let lost = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("peer loss should be detected")
        .expect("notification");
    assert_eq!(lost.key, "controller");
    assert_eq!(lost.endpoint, address);
    assert!(lost.removed);
    assert!(!registry.contains("controller").await);
}

#[tokio::test]
async fn test_required_client_auth_rejects_anonymous_callers() {
    let certs = test_certs();
    let config = TransportConfig {
        client_auth: ClientAuthPolicy::Required,
        ..test_config()
    };
    let (address, handle, task) =
        start_server(&certs, config.clone(), CapabilityResponder::default()).await;

    let ca_pem =
        std::fs::read_to_string(certs.dir.path().join("ca.cert")).expect("read CA certificate");
    let anonymous = Endpoint::from_shared(format!("https://{}", address))
        .expect("endpoint")
        .tls_config(
            ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(ca_pem))
                .domain_name(PEER_NAME),
        )
        .expect("tls config");
    let accepted = match anonymous.connect().await {
        Err(_) => false,
        Ok(channel) => ControllerCapServiceClient::new(channel)
            .is_grpc_compressed(RpcVoid {})
            .await
            .is_ok(),
    };
    assert!(!accepted, "caller without a certificate must be rejected");

    let registry = ClientRegistry::with_identity(certs.loader.clone(), config.clone());
    registry
        .register::<ControllerCapServiceClient<Channel>>("controller", &address, false)
        .await
        .expect("register");
    let mut stub: ControllerCapServiceClient<Channel> = registry
        .acquire("controller", None, None)
        .await
        .expect("acquire");
    assert!(stub.is_grpc_compressed(RpcVoid {}).await.is_ok());

    registry.shutdown().await;
    stop(handle, task).await;
}
