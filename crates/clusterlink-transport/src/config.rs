//! Transport tuning
//!
//! Every knob has a default matching what deployed peers expect. Each can be
//! overridden through a `CLUSTERLINK_*` environment variable; values that do
//! not parse are ignored.

use std::time::Duration;

use clusterlink_identity::ClientAuthPolicy;
use serde::Deserialize;

/// Default maximum RPC payload, enforced on both send and receive
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Delay before a failed accept loop is restarted
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// How long a transient failure may last before the peer is considered lost
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(1);

/// Bound on the compression capability call
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on establishing the underlying socket
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_MESSAGE_SIZE_ENV: &str = "CLUSTERLINK_GRPC_MAX_MESSAGE_SIZE";
const RESTART_DELAY_ENV: &str = "CLUSTERLINK_SERVER_RESTART_DELAY_SECS";
const SETTLE_WINDOW_ENV: &str = "CLUSTERLINK_SETTLE_WINDOW_MS";
const PROBE_TIMEOUT_ENV: &str = "CLUSTERLINK_PROBE_TIMEOUT_SECS";
const CONNECT_TIMEOUT_ENV: &str = "CLUSTERLINK_CONNECT_TIMEOUT_SECS";
const CLIENT_AUTH_ENV: &str = "CLUSTERLINK_CLIENT_AUTH";

/// Transport configuration shared by servers, dialers and the registry
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Maximum encoded or decoded message size in bytes
    pub max_message_size: usize,
    /// Delay between accept loop restarts
    pub restart_delay: Duration,
    /// Transient-failure debounce window for the watchdog
    pub settle_window: Duration,
    /// Compression probe timeout
    pub probe_timeout: Duration,
    /// Socket connect timeout
    pub connect_timeout: Duration,
    /// HTTP/2 keep-alive ping interval
    pub keepalive_interval: Duration,
    /// HTTP/2 keep-alive ping timeout
    pub keepalive_timeout: Duration,
    /// Whether TCP servers require a client certificate
    pub client_auth: ClientAuthPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            restart_delay: DEFAULT_RESTART_DELAY,
            settle_window: DEFAULT_SETTLE_WINDOW,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(20),
            client_auth: ClientAuthPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(size) = lookup(MAX_MESSAGE_SIZE_ENV).and_then(|v| v.trim().parse().ok()) {
            config.max_message_size = size;
        }
        if let Some(secs) = parse(RESTART_DELAY_ENV) {
            config.restart_delay = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(SETTLE_WINDOW_ENV) {
            config.settle_window = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(PROBE_TIMEOUT_ENV) {
            config.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(CONNECT_TIMEOUT_ENV) {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = lookup(CLIENT_AUTH_ENV).and_then(|v| v.parse().ok()) {
            config.client_auth = policy;
        }
        config
    }
}
