//! Serve command - run a server endpoint answering capability checks

use clap::Args;
use clusterlink_identity::{ClientAuthPolicy, IdentityConfig, IdentityLoader};
use clusterlink_transport::{Carrier, CapabilityResponder, GrpcServer, TransportConfig};
use tracing::info;

use crate::Result;

/// Serve command arguments
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// `host:port` to serve with mutual TLS, or a Unix socket path
    #[arg(long)]
    pub listen: String,

    /// Reject TCP callers that present no client certificate
    #[arg(long)]
    pub require_client_cert: bool,

    /// Answer "not supported" to capability checks, like a legacy peer
    #[arg(long)]
    pub legacy: bool,
}

/// Run the server until Ctrl-C, then stop gracefully
pub async fn run(args: ServeArgs, identity: IdentityConfig) -> Result<()> {
    let mut config = TransportConfig::from_env();
    if args.require_client_cert {
        config.client_auth = ClientAuthPolicy::Required;
    }

    let mut server = match Carrier::of(&args.listen) {
        Carrier::Tcp => {
            let loader = IdentityLoader::new(identity);
            GrpcServer::bind_tcp(&args.listen, &loader, config).await?
        }
        Carrier::Unix => GrpcServer::bind_unix(&args.listen, config)?,
    };

    let responder = CapabilityResponder::new(!args.legacy);
    server
        .add_service(responder.controller_service())
        .add_service(responder.enforcer_service());

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            handle.graceful_stop();
        }
    });

    server.start().await?;
    Ok(())
}
