//! Commands module
//!
//! The boundary the UI host calls into. Every command resolves its session
//! through the `SessionRegistry` and returns errors that serialize as
//! `{kind, message}`.

pub mod config;
pub mod forwarding;
pub mod sftp;
pub mod ssh;

pub use config::*;
pub use forwarding::*;
pub use sftp::*;
pub use ssh::*;
