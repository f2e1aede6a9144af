//! Port Forwarding Module
//!
//! Local, remote, and dynamic (SOCKS5) tunnels multiplexed over a
//! session's SSH connection.

pub mod bridge;
pub mod dynamic;
pub mod local;
pub mod manager;
pub mod remote;

pub use bridge::ForwardStats;
pub use manager::{ForwardStatus, ForwardType, TunnelInfo, TunnelManager};
