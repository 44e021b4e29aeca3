//! Probe command - ask a peer whether it accepts compressed payloads

use std::sync::Arc;

use clap::Args;
use clusterlink_identity::{IdentityConfig, IdentityLoader};
use clusterlink_transport::{CapabilityProbe, CompressionProbe, GrpcDialer, TransportConfig};

use super::Role;
use crate::Result;

/// Probe command arguments
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Peer `host:port` or Unix socket path
    #[arg(long)]
    pub endpoint: String,

    /// Which capability service the peer serves
    #[arg(long, value_enum, default_value_t = Role::Controller)]
    pub role: Role,
}

/// Print whether the peer supports compression
pub async fn run(args: ProbeArgs, identity: IdentityConfig) -> Result<()> {
    let config = TransportConfig::from_env();
    let dialer = Arc::new(GrpcDialer::new(
        Arc::new(IdentityLoader::new(identity)),
        config.clone(),
    ));
    let probe = CapabilityProbe::new(args.role.into(), dialer, config.probe_timeout);

    let supported = probe.supports_compression(&args.endpoint).await;
    println!("compression supported: {}", supported);
    Ok(())
}
