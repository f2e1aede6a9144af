//! Local Port Forwarding
//!
//! Listens on a local address and opens a direct-tcpip channel to the
//! target for every accepted connection.
//! Example: local 127.0.0.1:8888 -> SSH -> localhost:8888 on the server

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bridge::{bridge, ForwardContext};
use crate::ssh::SshError;

/// Target of a local forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
}

/// Run the accept loop until the tunnel is cancelled.
///
/// The connection is looked up per accepted client, so the listener keeps
/// working across reconnects. Clients arriving while the session has no
/// transport are dropped.
pub fn spawn_local_forward(
    listener: TcpListener,
    ctx: ForwardContext,
    target: LocalTarget,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Forward {}: accepted connection from {}", ctx.forward_id, peer_addr);

                        let ctx = ctx.clone();
                        let target = target.clone();
                        tokio::spawn(async move {
                            let _guard = ctx.stats.open();
                            if let Err(e) = handle_connection(&ctx, stream, peer_addr, &target).await {
                                warn!("Forward {} connection error: {}", ctx.forward_id, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Forward {} accept error: {}", ctx.forward_id, e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("Local port forward {} task exited", ctx.forward_id);
    })
}

async fn handle_connection(
    ctx: &ForwardContext,
    stream: TcpStream,
    peer_addr: SocketAddr,
    target: &LocalTarget,
) -> Result<(), SshError> {
    let conn = ctx.source.current()?;
    let origin = peer_addr.ip().to_string();
    let channel = tokio::select! {
        channel = conn.open_direct_tcpip(
            &target.host,
            target.port,
            &origin,
            peer_addr.port(),
        ) => channel?,
        _ = ctx.cancel.cancelled() => return Ok(()),
    };
    debug!("Opened channel for forward to {}:{}", target.host, target.port);

    bridge(stream, channel, &ctx.stats, &ctx.cancel).await;
    Ok(())
}
