//! Internal certificate issuance
//!
//! Produces the certificate set every cluster process loads at startup: one
//! CA, and a node certificate usable for both serving and dialing. The node
//! certificate's common name doubles as the peer name clients verify, so it
//! is also added as a DNS subject alternative name.

use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::info;

use crate::config::{DEFAULT_CA_CERT_FILE, DEFAULT_CERT_FILE, DEFAULT_KEY_FILE};

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for node certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Compute certificate validity period from now
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Certificate authority for the internal certificate set
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load an existing CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a node certificate valid for both TLS server and client auth
    ///
    /// `common_name` becomes the subject CN (omitted when empty) and, when it
    /// is a valid DNS name, an extra SAN. Returns `(cert_pem, key_pem)`.
    pub fn issue_node_cert(&self, common_name: &str, sans: &[&str]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if !common_name.is_empty() {
            dn.push(
                DnType::CommonName,
                DnValue::Utf8String(common_name.to_string()),
            );
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let mut names: Vec<&str> = sans.to_vec();
        if !common_name.is_empty() && !names.contains(&common_name) {
            names.push(common_name);
        }
        params.subject_alt_names = names
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let node_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate node key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&node_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign node cert: {}", e))
        })?;

        Ok((cert.pem(), node_key.serialize_pem()))
    }
}

/// Issue a node certificate for `name` and write the full set into `dir`
///
/// Writes the CA certificate, node certificate and node key under the
/// default file names so an [`crate::IdentityConfig::with_dir`] pointing at
/// `dir` loads them. The key file is created owner-readable only.
pub fn write_cert_set(ca: &CertificateAuthority, name: &str, dir: &Path) -> Result<()> {
    let (cert_pem, key_pem) = ca.issue_node_cert(name, &["localhost", "127.0.0.1", "::1"])?;

    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(DEFAULT_CA_CERT_FILE), ca.ca_cert_pem())?;
    std::fs::write(dir.join(DEFAULT_CERT_FILE), cert_pem)?;
    write_key_file(&dir.join(DEFAULT_KEY_FILE), &key_pem)?;

    info!(dir = %dir.display(), %name, "Wrote internal certificate set");
    Ok(())
}

/// Write a PEM private key readable by its owner only
#[cfg(unix)]
pub fn write_key_file(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

/// Write a PEM private key
#[cfg(not(unix))]
pub fn write_key_file(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
