//! Internal identity for cluster RPC
//!
//! Every process in the cluster carries the same internal certificate set: a
//! CA certificate, a node certificate, and the node's private key. This crate
//! loads that material once, derives the peer name clients expect servers to
//! present, and turns it into TLS credentials for both roles.
//!
//! # Public API
//!
//! ## Identity
//! - [`IdentityConfig`]: where the certificate files live
//! - [`Identity`]: loaded certificate material plus the derived peer name
//! - [`IdentityLoader`]: lazy, load-once, process-wide cache of [`Identity`]
//!
//! ## Credentials
//! - [`server_tls_config`]: rustls server config (cipher allowlist, TLS 1.2
//!   floor, server cipher preference, client-auth policy)
//! - [`client_tls_config`]: tonic client TLS config verifying the peer name
//! - [`ClientAuthPolicy`]: whether callers must present a certificate
//!
//! ## PKI
//! - [`pki::CertificateAuthority`]: issues internal node certificates

pub mod config;
pub mod identity;
pub mod pki;
pub mod tls;

pub use config::IdentityConfig;
pub use identity::{Identity, IdentityError, IdentityLoader};
pub use tls::{
    client_tls_config, install_crypto_provider, server_tls_config, ClientAuthPolicy,
    ALLOWED_CIPHER_SUITES,
};
