//! clusterlink CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clusterlink_identity::IdentityConfig;

/// clusterlink - internal RPC transport tools
#[derive(Parser, Debug)]
#[command(name = "clusterlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding ca.cert, cert.pem and cert.key
    #[arg(long, global = true, env = "CLUSTERLINK_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the capability services until interrupted
    Serve(commands::serve::ServeArgs),
    /// Ask a peer whether it accepts compressed payloads
    Probe(commands::probe::ProbeArgs),
    /// Hold a pooled connection to a peer and report when it is lost
    Watch(commands::watch::WatchArgs),
    /// Manage internal certificates
    Certs {
        #[command(subcommand)]
        command: commands::certs::CertsCommand,
    },
}

impl Cli {
    /// Identity file locations for this invocation
    pub fn identity_config(&self) -> IdentityConfig {
        match &self.cert_dir {
            Some(dir) => IdentityConfig::with_dir(dir),
            None => IdentityConfig::from_env(),
        }
    }

    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let identity = self.identity_config();
        match self.command {
            Commands::Serve(args) => commands::serve::run(args, identity).await,
            Commands::Probe(args) => commands::probe::run(args, identity).await,
            Commands::Watch(args) => commands::watch::run(args, identity).await,
            Commands::Certs { command } => commands::certs::run(command),
        }
    }
}
