//! Watch command - hold a pooled connection and report peer loss
//!
//! Registers the endpoint in a client registry, acquires a capability stub
//! and calls it once. Each time the peer is lost the connection is acquired
//! again, unless the entry was registered with `--auto-remove`, in which
//! case the command exits.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clusterlink_identity::{IdentityConfig, IdentityLoader};
use clusterlink_proto::controller_cap_service_client::ControllerCapServiceClient;
use clusterlink_proto::enforcer_cap_service_client::EnforcerCapServiceClient;
use clusterlink_proto::RpcVoid;
use clusterlink_transport::{
    CapabilityProbe, ClientRegistry, CompressionProbe, ConnectionLost, TransportConfig,
};
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing::{info, warn};

use super::Role;
use crate::{Error, Result};

const WATCH_KEY: &str = "watch";

/// Watch command arguments
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Peer `host:port` or Unix socket path
    #[arg(long)]
    pub endpoint: String,

    /// Which capability service the peer serves
    #[arg(long, value_enum, default_value_t = Role::Controller)]
    pub role: Role,

    /// Remove the registry entry when the peer is lost, and exit
    #[arg(long)]
    pub auto_remove: bool,

    /// Seconds to wait before reconnecting after the peer is lost
    #[arg(long, default_value_t = 5)]
    pub retry_secs: u64,
}

/// Run until Ctrl-C or, with `--auto-remove`, until the peer is lost
pub async fn run(args: WatchArgs, identity: IdentityConfig) -> Result<()> {
    let config = TransportConfig::from_env();
    let loader = Arc::new(IdentityLoader::new(identity));
    let registry = ClientRegistry::with_identity(loader, config.clone());
    let probe = CapabilityProbe::new(args.role.into(), registry.dialer(), config.probe_timeout);

    match args.role {
        Role::Controller => {
            registry
                .register::<ControllerCapServiceClient<Channel>>(
                    WATCH_KEY,
                    &args.endpoint,
                    args.auto_remove,
                )
                .await?
        }
        Role::Enforcer => {
            registry
                .register::<EnforcerCapServiceClient<Channel>>(
                    WATCH_KEY,
                    &args.endpoint,
                    args.auto_remove,
                )
                .await?
        }
    }

    let (lost_tx, mut lost_rx) = mpsc::channel::<ConnectionLost>(4);
    let result = loop {
        match check(&registry, args.role, &probe, lost_tx.clone()).await {
            Ok(compressed) => info!(endpoint = %args.endpoint, compressed, "Peer answered"),
            Err(e) => warn!(endpoint = %args.endpoint, error = %e, "Peer check failed"),
        }

        // Without a live connection there is nothing to lose; retry after the delay
        if registry.is_connected(WATCH_KEY).await {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Ok(()),
                lost = lost_rx.recv() => {
                    let Some(lost) = lost else {
                        break Err(Error::command_failed("notification channel closed"));
                    };
                    warn!(
                        endpoint = %lost.endpoint,
                        state = ?lost.state,
                        removed = lost.removed,
                        "Peer lost"
                    );
                    if lost.removed {
                        break Ok(());
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(args.retry_secs)) => {}
        }
    };

    registry.shutdown().await;
    result
}

/// Acquire the pooled stub and ask the peer once
async fn check(
    registry: &ClientRegistry,
    role: Role,
    probe: &CapabilityProbe,
    on_lost: mpsc::Sender<ConnectionLost>,
) -> Result<bool> {
    let probe = Some(probe as &dyn CompressionProbe);
    let answer = match role {
        Role::Controller => {
            let mut stub: ControllerCapServiceClient<Channel> =
                registry.acquire(WATCH_KEY, probe, Some(on_lost)).await?;
            stub.is_grpc_compressed(RpcVoid {}).await?
        }
        Role::Enforcer => {
            let mut stub: EnforcerCapServiceClient<Channel> =
                registry.acquire(WATCH_KEY, probe, Some(on_lost)).await?;
            stub.is_grpc_compressed(RpcVoid {}).await?
        }
    };
    Ok(answer.into_inner().value)
}
