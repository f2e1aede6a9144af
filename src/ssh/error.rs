//! SSH Error types

use serde::ser::SerializeStruct;
use serde::Serialize;
use thiserror::Error;

/// Coarse error classification carried across the UI boundary.
///
/// The host decides from the kind alone whether to retry, prompt, or just
/// display the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Auth,
    Network,
    Timeout,
    ChannelOpen,
    Bind,
    Tunnel,
    Exec,
    Protocol,
    Key,
    Disconnected,
    NotFound,
    Io,
    PermissionDenied,
    SessionClosed,
    Cancelled,
    InvalidState,
    WrongPassphrase,
    DecryptionFailed,
    Locked,
    Vault,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    #[error("Bind failed on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::AuthenticationFailed(_) => ErrorKind::Auth,
            SshError::ConnectionFailed(_) => ErrorKind::Network,
            SshError::Timeout(_) => ErrorKind::Timeout,
            SshError::ChannelOpen(_) => ErrorKind::ChannelOpen,
            SshError::Bind { .. } => ErrorKind::Bind,
            SshError::Tunnel(_) => ErrorKind::Tunnel,
            SshError::Exec(_) => ErrorKind::Exec,
            SshError::ProtocolError(_) => ErrorKind::Protocol,
            SshError::KeyError(_) => ErrorKind::Key,
            SshError::SessionNotFound(_) => ErrorKind::NotFound,
            SshError::IoError(_) => ErrorKind::Io,
            SshError::Disconnected => ErrorKind::Disconnected,
        }
    }

    /// Whether a connection that failed with this error may be retried by
    /// the reconnect loop. Credentials and key problems never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SshError::ConnectionFailed(_)
                | SshError::Timeout(_)
                | SshError::Disconnected
                | SshError::IoError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::IoError(e),
            russh::Error::Disconnect | russh::Error::HUP => SshError::Disconnected,
            russh::Error::ConnectionTimeout | russh::Error::KeepaliveTimeout => {
                SshError::Timeout(err.to_string())
            }
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

// Errors cross the UI boundary as `{kind, message}`
impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("SshError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_never_transient() {
        assert!(!SshError::AuthenticationFailed("bad password".into()).is_transient());
        assert!(!SshError::KeyError("bad key".into()).is_transient());
        assert!(SshError::ConnectionFailed("reset".into()).is_transient());
        assert!(SshError::Timeout("slow".into()).is_transient());
        assert!(SshError::Disconnected.is_transient());
    }

    #[test]
    fn test_serializes_kind_and_message() {
        let err = SshError::Bind {
            addr: "127.0.0.1:8080".into(),
            reason: "Port already in use".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "bind");
        assert_eq!(
            json["message"],
            "Bind failed on 127.0.0.1:8080: Port already in use"
        );
    }
}
