//! CLI commands

use clap::ValueEnum;
use clusterlink_transport::PeerRole;

pub mod certs;
pub mod probe;
pub mod serve;
pub mod watch;

/// Peer role selecting which capability service to call
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// share.ControllerCapService
    Controller,
    /// share.EnforcerCapService
    Enforcer,
}

impl From<Role> for PeerRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Controller => PeerRole::Controller,
            Role::Enforcer => PeerRole::Enforcer,
        }
    }
}
