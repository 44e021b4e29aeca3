//! Certs command - generate the internal certificate set

use std::path::PathBuf;

use clap::Subcommand;
use clusterlink_identity::config::DEFAULT_PEER_NAME;
use clusterlink_identity::pki::{write_cert_set, write_key_file, CertificateAuthority};

use crate::{Error, Result};

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertsCommand {
    /// Issue a node certificate usable by every cluster process
    ///
    /// Signs with the CA given by `--ca-cert`/`--ca-key`, or creates a new
    /// one whose key can be kept with `--ca-key-out` for later runs.
    Generate {
        /// Output directory
        #[arg(long)]
        dir: PathBuf,

        /// Node certificate common name; clients expect servers to present it
        #[arg(long, default_value = DEFAULT_PEER_NAME)]
        name: String,

        /// CA common name
        #[arg(long, default_value = "clusterlink-ca")]
        ca_name: String,

        /// Existing CA certificate to sign with
        #[arg(long, requires = "ca_key")]
        ca_cert: Option<PathBuf>,

        /// Private key of the existing CA
        #[arg(long, requires = "ca_cert")]
        ca_key: Option<PathBuf>,

        /// Save the private key of a newly created CA here
        #[arg(long, conflicts_with = "ca_key")]
        ca_key_out: Option<PathBuf>,
    },
}

/// Run a certs subcommand
pub fn run(command: CertsCommand) -> Result<()> {
    match command {
        CertsCommand::Generate {
            dir,
            name,
            ca_name,
            ca_cert,
            ca_key,
            ca_key_out,
        } => {
            let ca = match (ca_cert, ca_key) {
                (Some(cert_path), Some(key_path)) => {
                    let cert_pem = std::fs::read_to_string(&cert_path)?;
                    let key_pem = std::fs::read_to_string(&key_path)?;
                    CertificateAuthority::from_pem(&cert_pem, &key_pem)?
                }
                (None, None) => {
                    let ca = CertificateAuthority::new(&ca_name)?;
                    if let Some(path) = ca_key_out {
                        write_key_file(&path, ca.ca_key_pem())?;
                        println!("wrote CA key to {}", path.display());
                    }
                    ca
                }
                _ => {
                    return Err(Error::command_failed(
                        "--ca-cert and --ca-key must be given together",
                    ))
                }
            };
            write_cert_set(&ca, &name, &dir)?;
            println!("wrote certificate set for {} to {}", name, dir.display());
            Ok(())
        }
    }
}
