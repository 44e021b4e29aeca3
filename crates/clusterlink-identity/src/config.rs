//! Location of the internal certificate material

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default directory holding the internal certificate set
pub const DEFAULT_CERT_DIR: &str = "/etc/clusterlink/certs/internal";

/// Environment variable overriding [`DEFAULT_CERT_DIR`]
pub const CERT_DIR_ENV: &str = "CLUSTERLINK_CERT_DIR";

/// Default CA certificate file name
pub const DEFAULT_CA_CERT_FILE: &str = "ca.cert";

/// Default node certificate file name
pub const DEFAULT_CERT_FILE: &str = "cert.pem";

/// Default node private key file name
pub const DEFAULT_KEY_FILE: &str = "cert.key";

/// Peer name used when the node certificate carries no common name
pub const DEFAULT_PEER_NAME: &str = "clusterlink-internal";

/// Where to find the CA certificate, node certificate and node key (all PEM)
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct IdentityConfig {
    /// Directory containing the three files
    pub cert_dir: PathBuf,
    /// CA certificate file name within `cert_dir`
    pub ca_cert_file: String,
    /// Node certificate file name within `cert_dir`
    pub cert_file: String,
    /// Node private key file name within `cert_dir`
    pub key_file: String,
    /// Expected peer name when it cannot be derived from the node certificate
    pub fallback_peer_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::with_dir(DEFAULT_CERT_DIR)
    }
}

impl IdentityConfig {
    /// Default file names inside `dir`
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: dir.into(),
            ca_cert_file: DEFAULT_CA_CERT_FILE.to_string(),
            cert_file: DEFAULT_CERT_FILE.to_string(),
            key_file: DEFAULT_KEY_FILE.to_string(),
            fallback_peer_name: DEFAULT_PEER_NAME.to_string(),
        }
    }

    /// Default config, with the directory taken from `CLUSTERLINK_CERT_DIR` if set
    pub fn from_env() -> Self {
        match std::env::var(CERT_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Self::with_dir(dir),
            _ => Self::default(),
        }
    }

    /// Path to the CA certificate
    pub fn ca_cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_cert_file)
    }

    /// Path to the node certificate
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.cert_file)
    }

    /// Path to the node private key
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.key_file)
    }

    /// Directory containing the certificate set
    pub fn dir(&self) -> &Path {
        &self.cert_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = IdentityConfig::default();
        assert_eq!(
            config.ca_cert_path(),
            PathBuf::from("/etc/clusterlink/certs/internal/ca.cert")
        );
        assert_eq!(
            config.cert_path(),
            PathBuf::from("/etc/clusterlink/certs/internal/cert.pem")
        );
        assert_eq!(
            config.key_path(),
            PathBuf::from("/etc/clusterlink/certs/internal/cert.key")
        );
        assert_eq!(config.fallback_peer_name, DEFAULT_PEER_NAME);
    }

    #[test]
    fn test_with_dir_keeps_file_names() {
        let config = IdentityConfig::with_dir("/tmp/certs");
        assert_eq!(config.dir(), Path::new("/tmp/certs"));
        assert_eq!(config.key_path(), PathBuf::from("/tmp/certs/cert.key"));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: IdentityConfig =
            serde_json::from_str(r#"{"certDir": "/opt/certs", "keyFile": "node.key"}"#)
                .expect("config should deserialize");
        assert_eq!(config.cert_path(), PathBuf::from("/opt/certs/cert.pem"));
        assert_eq!(config.key_path(), PathBuf::from("/opt/certs/node.key"));
    }
}
