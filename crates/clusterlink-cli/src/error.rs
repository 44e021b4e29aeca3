//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("identity error: {0}")]
    Identity(#[from] clusterlink_identity::IdentityError),

    #[error("pki error: {0}")]
    Pki(#[from] clusterlink_identity::pki::PkiError),

    #[error("server error: {0}")]
    Server(#[from] clusterlink_transport::ServerError),

    #[error("registry error: {0}")]
    Registry(#[from] clusterlink_transport::RegistryError),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_message() {
        let err = Error::command_failed("peer lost");
        assert_eq!(err.to_string(), "command failed: peer lost");
    }
}
