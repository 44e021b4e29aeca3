//! Internal identity material
//!
//! The CA certificate, node certificate and node key are read from disk the
//! first time any server or client needs credentials, then shared read-only
//! for the rest of the process lifetime.
//!
//! Servers and clients use the same certificate set, so the name a client
//! expects the server to present is the common name of the local node
//! certificate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::config::IdentityConfig;

/// Identity loading errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A certificate or key file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A file was read but its PEM content is unusable
    #[error("invalid PEM in {path}: {message}")]
    InvalidPem {
        /// File that failed
        path: PathBuf,
        /// What was wrong with it
        message: String,
    },

    /// TLS credential construction failed
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Loaded certificate material plus the derived peer name
pub struct Identity {
    ca_cert_pem: String,
    cert_pem: String,
    /// Node private key PEM (zeroized on drop)
    key_pem: Zeroizing<String>,
    ca_certs: Vec<CertificateDer<'static>>,
    cert_chain: Vec<CertificateDer<'static>>,
    peer_name: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("ca_certs", &self.ca_certs.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("peer_name", &self.peer_name)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Read and validate the certificate set described by `config`
    pub fn load(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let ca_path = config.ca_cert_path();
        let cert_path = config.cert_path();
        let key_path = config.key_path();

        let ca_cert_pem = read_file(&ca_path)?;
        let cert_pem = read_file(&cert_path)?;
        let key_pem = Zeroizing::new(read_file(&key_path)?);

        Self::from_parts(
            (ca_path, ca_cert_pem),
            (cert_path, cert_pem),
            (key_path, key_pem),
            &config.fallback_peer_name,
        )
    }

    /// Build an identity from in-memory PEM strings
    pub fn from_pem(
        ca_cert_pem: &str,
        cert_pem: &str,
        key_pem: &str,
        fallback_peer_name: &str,
    ) -> Result<Self, IdentityError> {
        Self::from_parts(
            (PathBuf::from("<ca>"), ca_cert_pem.to_string()),
            (PathBuf::from("<cert>"), cert_pem.to_string()),
            (PathBuf::from("<key>"), Zeroizing::new(key_pem.to_string())),
            fallback_peer_name,
        )
    }

    fn from_parts(
        (ca_path, ca_cert_pem): (PathBuf, String),
        (cert_path, cert_pem): (PathBuf, String),
        (key_path, key_pem): (PathBuf, Zeroizing<String>),
        fallback_peer_name: &str,
    ) -> Result<Self, IdentityError> {
        let ca_certs = parse_certs(&ca_path, &ca_cert_pem)?;
        let cert_chain = parse_certs(&cert_path, &cert_pem)?;

        // Validate the key now so a bad key fails at first use, not mid-handshake
        PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).map_err(|e| {
            IdentityError::InvalidPem {
                path: key_path,
                message: format!("no usable private key: {}", e),
            }
        })?;

        let peer_name = derive_peer_name(&cert_chain)
            .unwrap_or_else(|| fallback_peer_name.to_string());
        info!(cn = %peer_name, "Expected server name");

        Ok(Self {
            ca_cert_pem,
            cert_pem,
            key_pem,
            ca_certs,
            cert_chain,
            peer_name,
        })
    }

    /// Name clients expect servers to present
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Node certificate PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Node private key PEM
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Parsed CA certificates
    pub fn ca_certs(&self) -> &[CertificateDer<'static>] {
        &self.ca_certs
    }

    /// Parsed node certificate chain
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Fresh copy of the node private key
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, IdentityError> {
        PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|e| IdentityError::Tls(format!("failed to load private key: {}", e)))
    }
}

/// Load-once cache of the process identity
///
/// The first successful [`IdentityLoader::get`] reads the files; later calls
/// return the same [`Identity`]. A failed load is not cached, so the next
/// caller reads the files again.
#[derive(Debug)]
pub struct IdentityLoader {
    config: IdentityConfig,
    identity: OnceCell<Arc<Identity>>,
}

impl IdentityLoader {
    /// Create a loader that reads from `config` on first use
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            identity: OnceCell::new(),
        }
    }

    /// Get the identity, loading it on first call
    pub fn get(&self) -> Result<Arc<Identity>, IdentityError> {
        self.identity
            .get_or_try_init(|| {
                debug!(dir = %self.config.dir().display(), "Loading internal certificates");
                Identity::load(&self.config).map(Arc::new)
            })
            .map(Arc::clone)
    }

    /// Whether the identity has been loaded
    pub fn is_loaded(&self) -> bool {
        self.identity.get().is_some()
    }

    /// Where the certificate files are read from
    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }
}

fn read_file(path: &Path) -> Result<String, IdentityError> {
    std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(path: &Path, pem: &str) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IdentityError::InvalidPem {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(IdentityError::InvalidPem {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Common name of the first parseable certificate in `chain`
///
/// Returns None when no certificate parses or the common name is empty.
pub fn derive_peer_name(chain: &[CertificateDer<'_>]) -> Option<String> {
    chain
        .iter()
        .find_map(|der| X509Certificate::from_der(der.as_ref()).ok())
        .and_then(|(_, cert)| {
            cert.subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
        })
        .filter(|cn| !cn.is_empty())
}
