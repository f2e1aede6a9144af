//! SSH module - connections and the channels they carry
//!
//! This module provides the SSH layer using the russh library.
//!
//! # Features
//! - Password and private key authentication
//! - Jump host (single hop) support
//! - Host key verification (trust on first use or pinned fingerprints)
//! - Interactive shells, exec channels, direct-tcpip and tcpip-forward
//! - Connection supervision with keepalive and auto-reconnect

mod client;
pub mod config;
pub mod error;
mod handle_owner;
mod proxy;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use client::{fingerprint, KnownHosts, RusshConnection, RusshConnector};
pub use config::{
    AuthConfig, AuthMethod, EndpointConfig, HostKeyPolicy, SecretValue, SessionConfig, SshConfig,
    Timeouts,
};
pub use error::{ErrorKind, SshError};
pub use supervisor::{ConnectionSupervisor, SupervisorOptions};
pub use transport::{
    BoxedStream, ChannelCommand, ChannelEvent, ChannelIo, ConnectionSource, Connector,
    InboundForward, PingResult, PtyRequest, SshConnection,
};
