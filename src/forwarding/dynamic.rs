//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination
//!
//! Only the CONNECT command with the NO AUTH method is supported.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bridge::{bridge, ForwardContext};
use crate::ssh::SshError;

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_UNACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Destination a SOCKS5 client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub host: String,
    pub port: u16,
}

fn socks_error(context: &str, e: std::io::Error) -> SshError {
    SshError::Tunnel(format!("{}: {}", context, e))
}

/// Run the SOCKS5 accept loop until the tunnel is cancelled
pub fn spawn_dynamic_forward(listener: TcpListener, ctx: ForwardContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("SOCKS5: Accepted connection from {}", peer_addr);

                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let _guard = ctx.stats.open();
                            let result = tokio::select! {
                                r = handle_socks5_connection(&ctx, stream, peer_addr) => r,
                                _ = ctx.cancel.cancelled() => Ok(()),
                            };
                            if let Err(e) = result {
                                warn!("SOCKS5 connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("SOCKS5 proxy {} task exited", ctx.forward_id);
    })
}

async fn handle_socks5_connection(
    ctx: &ForwardContext,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), SshError> {
    let target = match negotiate(&mut stream).await? {
        Some(target) => target,
        None => return Ok(()),
    };
    debug!("SOCKS5: Connecting to {}:{}", target.host, target.port);

    let conn = match ctx.source.current() {
        Ok(conn) => conn,
        Err(e) => {
            send_reply(&mut stream, socks5::REP_NETWORK_UNREACHABLE).await?;
            return Err(e);
        }
    };

    let origin = peer_addr.ip().to_string();
    let channel = match conn
        .open_direct_tcpip(&target.host, target.port, &origin, peer_addr.port())
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open SSH channel to {}:{}: {}",
                target.host, target.port, e
            );
            send_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, socks5::REP_SUCCESS).await?;
    debug!("SOCKS5: Tunnel established to {}:{}", target.host, target.port);

    bridge(stream, channel, &ctx.stats, &ctx.cancel).await;
    Ok(())
}

/// Run the greeting and request phases.
///
/// Returns `None` after replying with a refusal the client can act on
/// (unsupported auth, command or address type).
pub async fn negotiate<S>(stream: &mut S) -> Result<Option<SocksTarget>, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    // Phase 1: authentication negotiation
    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| socks_error("Failed to read SOCKS5 greeting", e))?;
    if buf[0] != socks5::VERSION {
        return Err(SshError::Tunnel(format!(
            "Unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let nmethods = buf[1] as usize;
    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| socks_error("Failed to read auth methods", e))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_UNACCEPTABLE])
            .await
            .map_err(|e| socks_error("Failed to send auth response", e))?;
        debug!("SOCKS5: client does not offer NO AUTH");
        return Ok(None);
    }
    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| socks_error("Failed to send auth response", e))?;

    // Phase 2: connection request
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| socks_error("Failed to read SOCKS5 request", e))?;
    let (version, cmd, atyp) = (buf[0], buf[1], buf[3]);

    if version != socks5::VERSION {
        return Err(SshError::Tunnel("Invalid SOCKS5 version in request".into()));
    }
    if cmd != socks5::CMD_CONNECT {
        send_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        debug!("SOCKS5: unsupported command {}", cmd);
        return Ok(None);
    }

    let target = match atyp {
        socks5::ATYP_IPV4 => {
            stream
                .read_exact(&mut buf[..6])
                .await
                .map_err(|e| socks_error("Failed to read IPv4 address", e))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            SocksTarget {
                host: ip.to_string(),
                port: u16::from_be_bytes([buf[4], buf[5]]),
            }
        }
        socks5::ATYP_DOMAIN => {
            stream
                .read_exact(&mut buf[..1])
                .await
                .map_err(|e| socks_error("Failed to read domain length", e))?;
            let len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..len + 2])
                .await
                .map_err(|e| socks_error("Failed to read domain", e))?;
            SocksTarget {
                host: String::from_utf8_lossy(&buf[..len]).to_string(),
                port: u16::from_be_bytes([buf[len], buf[len + 1]]),
            }
        }
        socks5::ATYP_IPV6 => {
            stream
                .read_exact(&mut buf[..18])
                .await
                .map_err(|e| socks_error("Failed to read IPv6 address", e))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            SocksTarget {
                host: Ipv6Addr::from(octets).to_string(),
                port: u16::from_be_bytes([buf[16], buf[17]]),
            }
        }
        _ => {
            send_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            debug!("SOCKS5: unsupported address type {}", atyp);
            return Ok(None);
        }
    };

    if target.host.is_empty() {
        send_reply(stream, socks5::REP_GENERAL_FAILURE).await?;
        return Ok(None);
    }
    Ok(Some(target))
}

/// Send a reply; the bound address is always reported as 0.0.0.0:0
async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream
        .write_all(&reply)
        .await
        .map_err(|e| socks_error("Failed to send SOCKS5 reply", e))
}
