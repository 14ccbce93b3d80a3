//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A single authentication method failed (transport or signer error).
    #[error("Authentication error ({method}): {message}")]
    Auth { method: String, message: String },

    /// Every candidate method was tried without success.
    #[error("Authentication failed, methods tried: [{}]", .tried.join(", "))]
    AuthFailed { tried: Vec<String> },

    #[error("Host key verification failed: {0}")]
    HostVerificationFailed(String),

    /// Local misuse of the engine, e.g. a missing subsystem or a closed session.
    #[error("Operation error: {0}")]
    Operation(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Key error: {0}")]
    Key(#[from] crate::keys::KeyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Failures that invalidate the whole session rather than one request.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            SshError::ConnectionFailed(_)
                | SshError::Timeout(_)
                | SshError::Disconnected
                | SshError::Io(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::ConnectionTimeout => SshError::Timeout(err.to_string()),
            russh::Error::IO(e) => SshError::Io(e),
            other => SshError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Key(crate::keys::KeyError::ParseError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failed_lists_methods() {
        let err = SshError::AuthFailed {
            tried: vec!["publickey".into(), "password".into()],
        };
        assert_eq!(
            err.to_string(),
            "Authentication failed, methods tried: [publickey, password]"
        );
    }

    #[test]
    fn test_russh_disconnect_maps_to_disconnected() {
        assert!(matches!(
            SshError::from(russh::Error::Disconnect),
            SshError::Disconnected
        ));
        assert!(SshError::Disconnected.is_connection_level());
        assert!(!SshError::Operation("x".into()).is_connection_level());
    }
}
