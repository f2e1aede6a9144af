//! Transfer error types

use serde::ser::SerializeStruct;
use serde::Serialize;
use thiserror::Error;

use crate::ssh::error::ErrorKind;

/// Per-transfer failure. Recorded on the transfer, never promoted to the
/// session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("session closed")]
    SessionClosed,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            TransferError::NotFound(_) | TransferError::UnknownTransfer(_) => ErrorKind::NotFound,
            TransferError::Io(_) => ErrorKind::Io,
            TransferError::SessionClosed => ErrorKind::SessionClosed,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::InvalidState(_) => ErrorKind::InvalidState,
            TransferError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Classify a local I/O error against `path`
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransferError::PermissionDenied(path.to_string())
            }
            std::io::ErrorKind::TimedOut => TransferError::Timeout(err.to_string()),
            _ => TransferError::Io(format!("{}: {}", path, err)),
        }
    }

    /// Classify an SFTP protocol error against `path`
    pub fn from_sftp(err: russh_sftp::client::error::Error, path: &str) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("no such file") || lower.contains("not found") {
            TransferError::NotFound(path.to_string())
        } else if lower.contains("permission denied") {
            TransferError::PermissionDenied(path.to_string())
        } else if lower.contains("timeout") {
            TransferError::Timeout(message)
        } else {
            TransferError::Io(format!("{}: {}", path, message))
        }
    }
}

impl Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TransferError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
