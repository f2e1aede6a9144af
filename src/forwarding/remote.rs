//! Remote Port Forwarding
//!
//! Asks the server to listen (tcpip-forward) and bridges every
//! forwarded-tcpip channel it opens to a local target.
//! Example: remote 0.0.0.0:9000 -> SSH -> local 127.0.0.1:3000
//!
//! The server-side listener belongs to one transport. After a reconnect
//! the manager requests it again and starts a fresh pump.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bridge::{bridge, ForwardContext};
use crate::ssh::transport::{InboundForward, SshConnection};
use crate::ssh::SshError;

/// Remote forward configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    /// Address the server listens on (e.g. "0.0.0.0", "localhost")
    pub remote_addr: String,
    /// Port the server listens on, 0 lets it choose
    pub remote_port: u16,
    /// Local host connections are forwarded to
    pub local_host: String,
    pub local_port: u16,
}

impl RemoteForward {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Ask the server to listen. Returns the port it actually bound.
pub async fn request_remote_forward(
    conn: &Arc<dyn SshConnection>,
    config: &RemoteForward,
) -> Result<(u16, mpsc::Receiver<InboundForward>), SshError> {
    info!(
        "Requesting remote port forward: {}:{} -> {}",
        config.remote_addr,
        config.remote_port,
        config.local_addr()
    );
    let (bound_port, inbound) = conn
        .request_remote_forward(&config.remote_addr, config.remote_port)
        .await
        .map_err(|e| match e {
            SshError::Tunnel(_) | SshError::Disconnected => e,
            other => SshError::Tunnel(format!(
                "Server refused to listen on {}:{}: {}",
                config.remote_addr, config.remote_port, other
            )),
        })?;
    info!(
        "Remote forward established: {}:{} (requested {}) -> {}",
        config.remote_addr,
        bound_port,
        config.remote_port,
        config.local_addr()
    );
    Ok((bound_port, inbound))
}

/// Bridge incoming forwarded channels until `ctx.cancel` fires or the
/// transport that delivered them goes away
pub fn spawn_remote_pump(
    mut inbound: mpsc::Receiver<InboundForward>,
    ctx: ForwardContext,
    config: RemoteForward,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let forwarded = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(forwarded) => forwarded,
                    None => {
                        debug!("Remote forward {}: transport closed", ctx.forward_id);
                        break;
                    }
                },
            };

            let ctx = ctx.clone();
            let local_addr = config.local_addr();
            tokio::spawn(async move {
                let _guard = ctx.stats.open();
                if let Err(e) = handle_forwarded_connection(&ctx, forwarded, &local_addr).await {
                    warn!("Remote forward {} connection error: {}", ctx.forward_id, e);
                }
            });
        }
        info!("Remote port forward {} pump exited", ctx.forward_id);
    })
}

async fn handle_forwarded_connection(
    ctx: &ForwardContext,
    forwarded: InboundForward,
    local_addr: &str,
) -> Result<(), SshError> {
    debug!(
        "Handling forwarded connection from {}:{}",
        forwarded.originator_host, forwarded.originator_port
    );

    let local_stream = TcpStream::connect(local_addr).await.map_err(|e| {
        SshError::Tunnel(format!("Failed to connect to {}: {}", local_addr, e))
    })?;
    if let Err(e) = local_stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    bridge(local_stream, forwarded.stream, &ctx.stats, &ctx.cancel).await;
    Ok(())
}
