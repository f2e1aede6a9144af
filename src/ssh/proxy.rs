//! Jump host chaining
//!
//! The target is reached by opening a `direct-tcpip` channel on the jump
//! connection and running a second SSH handshake over that raw stream:
//!
//! ```text
//! Client --SSH--> [Jump] --direct-tcpip--> [Target]
//! ```
//!
//! The jump connection itself is an ordinary supervised `SshConnection`,
//! so any depth of chaining falls out of composing connectors.

use russh::client::{self, Handle};
use tracing::info;

use super::client::{client_config, ClientHandler};
use super::config::SshConfig;
use super::error::SshError;
use super::transport::SshConnection;

/// Handshake with `target` over a stream tunnelled through `jump`
pub async fn connect_via(
    jump: &dyn SshConnection,
    target: &SshConfig,
    handler: ClientHandler,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Tunnelling to {} through jump host", target.address());

    let stream = jump
        .open_direct_tcpip(&target.host, target.port, "127.0.0.1", 0)
        .await
        .map_err(|e| {
            SshError::ConnectionFailed(format!(
                "Jump host could not reach {}: {}",
                target.address(),
                e
            ))
        })?;

    client::connect_stream(client_config(), stream, handler).await
}
