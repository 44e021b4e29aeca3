//! TLS credentials for both RPC roles
//!
//! Servers get a rustls config restricted to an AEAD-only cipher allowlist
//! with a TLS 1.2 floor and server-preferred suite ordering. Clients get a
//! tonic TLS config that verifies the server presents the peer name derived
//! from the local certificate.

use std::sync::Arc;

use rustls::crypto::aws_lc_rs;
use rustls::server::WebPkiClientVerifier;
use rustls::{CipherSuite, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tonic::transport::{Certificate, ClientTlsConfig};

use crate::identity::{Identity, IdentityError};

/// Cipher suites servers will negotiate
pub const ALLOWED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Whether a server requires callers to present a client certificate
///
/// Older peers dial without a client certificate, so servers default to
/// [`ClientAuthPolicy::Optional`]: a presented certificate must still chain
/// to the CA, but a missing one is accepted. This leaves server-side caller
/// authentication to the application. Use [`ClientAuthPolicy::Required`]
/// once every peer presents a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthPolicy {
    /// Verify a client certificate if one is presented
    #[default]
    Optional,
    /// Reject handshakes without a valid client certificate
    Required,
}

impl std::str::FromStr for ClientAuthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optional" => Ok(Self::Optional),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown client auth policy: {}", other)),
        }
    }
}

/// Install aws-lc-rs as the process-wide rustls provider
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn install_crypto_provider() {
    let _ = aws_lc_rs::default_provider().install_default();
}

/// Build the server-side rustls config for `identity`
pub fn server_tls_config(
    identity: &Identity,
    policy: ClientAuthPolicy,
) -> Result<ServerConfig, IdentityError> {
    let mut provider = aws_lc_rs::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED_CIPHER_SUITES.contains(&suite.suite()));
    let provider = Arc::new(provider);

    let mut roots = RootCertStore::empty();
    for cert in identity.ca_certs() {
        roots
            .add(cert.clone())
            .map_err(|e| IdentityError::Tls(format!("failed to add CA certificate: {}", e)))?;
    }

    let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone());
    if policy == ClientAuthPolicy::Optional {
        verifier = verifier.allow_unauthenticated();
    }
    let verifier = verifier
        .build()
        .map_err(|e| IdentityError::Tls(format!("failed to build client verifier: {}", e)))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| IdentityError::Tls(format!("unsupported protocol versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key()?)
        .map_err(|e| IdentityError::Tls(format!("invalid server certificate: {}", e)))?;

    config.ignore_client_order = true;
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(config)
}

/// Build the client-side tonic TLS config for `identity`
///
/// The server must present a certificate chaining to the CA and naming
/// [`Identity::peer_name`].
pub fn client_tls_config(identity: &Identity) -> ClientTlsConfig {
    ClientTlsConfig::new()
        .identity(tonic::transport::Identity::from_pem(
            identity.cert_pem(),
            identity.key_pem(),
        ))
        .ca_certificate(Certificate::from_pem(identity.ca_cert_pem()))
        .domain_name(identity.peer_name())
}
