//! Carrier selection from endpoint shape

use std::fmt;

/// Transport substrate for a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Carrier {
    /// TCP `host:port`, secured with mutual TLS
    Tcp,
    /// Unix socket path, unauthenticated
    Unix,
}

impl Carrier {
    /// Classify an endpoint string
    ///
    /// Any endpoint containing a port separator is TCP. Everything else is a
    /// Unix socket path.
    pub fn of(endpoint: &str) -> Self {
        if endpoint.contains(':') {
            Carrier::Tcp
        } else {
            Carrier::Unix
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Carrier::Tcp => write!(f, "tcp"),
            Carrier::Unix => write!(f, "unix"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_is_tcp() {
        assert_eq!(Carrier::of("10.0.0.5:8080"), Carrier::Tcp);
        assert_eq!(Carrier::of("controller.svc:18400"), Carrier::Tcp);
        assert_eq!(Carrier::of("[::1]:443"), Carrier::Tcp);
    }

    #[test]
    fn test_path_is_unix() {
        assert_eq!(Carrier::of("/var/run/agent.sock"), Carrier::Unix);
        assert_eq!(Carrier::of("relative.sock"), Carrier::Unix);
    }

    #[test]
    fn test_display() {
        assert_eq!(Carrier::Tcp.to_string(), "tcp");
        assert_eq!(Carrier::Unix.to_string(), "unix");
    }
}
