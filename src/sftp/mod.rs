//! File transfer module
//!
//! Per-session transfer queue over SFTP: upload, download, recursive
//! directory upload, pause/resume/cancel and conflict handling.

pub mod conflict;
pub mod engine;
pub mod error;
pub mod expand;
pub mod fs;
pub mod transfer;
pub mod types;

pub use conflict::{ConflictAction, ConflictDecision, ConflictInfo, ConflictPolicy, ConflictResolver};
pub use engine::{EnqueueOutcome, RemoteFsProvider, TransferEngine};
pub use error::TransferError;
pub use fs::{FileSystem, LocalFs, SftpFs};
pub use transfer::TransferControl;
pub use types::*;
