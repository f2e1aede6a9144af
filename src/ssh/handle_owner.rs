//! Handle Owner Task
//!
//! Exactly one task owns the russh `Handle<ClientHandler>`. Everything else
//! reaches it through a cloneable `HandleController` that sends
//! `HandleCommand`s over mpsc and waits for the reply on a oneshot.
//!
//! The owner task also watches the transport. When the handle reports
//! closed, or the last controller goes away, or `Disconnect` arrives, it
//! broadcasts on the disconnect channel, fails every queued command with
//! `Disconnect`, and ends the SSH session.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::transport::PingResult;

const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

type ChannelReply = oneshot::Sender<Result<Channel<Msg>, russh::Error>>;

pub enum HandleCommand {
    ChannelOpenSession {
        reply_tx: ChannelReply,
    },
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: ChannelReply,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },
    Disconnect,
}

/// Cloneable command handle for the owner task. Holding one grants full
/// control of the connection, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over an arbitrary command queue
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
            .await?
            .map_err(|e| SshError::ChannelOpen(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port,
            originator_host: originator_host.to_string(),
            originator_port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ChannelOpen(format!("direct-tcpip to {}:{}: {}", host, port, e)))
    }

    /// Returns the bound port, which differs from `port` when `port` is 0
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        self.request(|reply_tx| HandleCommand::TcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::Tunnel(format!("tcpip-forward {}:{} refused: {}", address, port, e)))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::Tunnel(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        self.request(|reply_tx| HandleCommand::Ping { reply_tx })
            .await
            .unwrap_or(PingResult::IoError)
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task and return the controller for it
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        let mut poll = tokio::time::interval(TRANSPORT_POLL_INTERVAL);
        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                    Some(cmd) => dispatch(&mut handle, cmd, &label).await,
                    None => {
                        info!("All controllers dropped for {}", label);
                        break;
                    }
                },
                _ = poll.tick() => {
                    if handle.is_closed() {
                        warn!("Transport closed for {}", label);
                        break;
                    }
                }
            }
        }

        let _ = notify.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

async fn dispatch(handle: &mut Handle<ClientHandler>, cmd: HandleCommand, label: &str) {
    match cmd {
        HandleCommand::ChannelOpenSession { reply_tx } => {
            let result = handle.channel_open_session().await;
            if reply_tx.send(result).is_err() {
                // Dropping the unclaimed channel closes it on the server
                warn!("Caller dropped before channel_open_session completed");
            }
        }
        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        } => {
            let result = handle
                .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                .await;
            if reply_tx.send(result).is_err() {
                warn!("Caller dropped before direct-tcpip to {}:{} completed", host, port);
            }
        }
        HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let result = handle.tcpip_forward(&address, port).await;
            if let Ok(bound_port) = result {
                if reply_tx.send(Ok(bound_port)).is_err() {
                    // Nobody will ever cancel this listener otherwise
                    warn!("Cancelling orphaned remote forward {}:{}", address, bound_port);
                    let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                }
            } else {
                let _ = reply_tx.send(result);
            }
        }
        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let _ = reply_tx.send(handle.cancel_tcpip_forward(&address, port).await);
        }
        HandleCommand::Ping { reply_tx } => {
            // keepalive@openssh.com with want_reply
            let result = match tokio::time::timeout(
                KEEPALIVE_PROBE_TIMEOUT,
                handle.send_keepalive(true),
            )
            .await
            {
                Ok(Ok(())) => PingResult::Ok,
                Ok(Err(e)) => {
                    warn!("Keepalive failed for {}: {}", label, e);
                    PingResult::IoError
                }
                Err(_) => {
                    warn!("Keepalive timed out for {}", label);
                    PingResult::Timeout
                }
            };
            debug!("Keepalive for {}: {:?}", label, result);
            let _ = reply_tx.send(result);
        }
        HandleCommand::Disconnect => {}
    }
}

/// Fail every queued command with `Disconnect`
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_once_owner_is_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        drop(cmd_rx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.tcpip_forward("127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_replies_route_back_to_caller() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::Ping { reply_tx } => {
                        let _ = reply_tx.send(PingResult::Timeout);
                    }
                    HandleCommand::TcpipForward { port, reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(if port == 0 { 40022 } else { port }));
                    }
                    _ => {}
                }
            }
        });

        assert_eq!(controller.ping().await, PingResult::Timeout);
        assert_eq!(controller.tcpip_forward("0.0.0.0", 0).await.unwrap(), 40022);
        assert_eq!(controller.tcpip_forward("0.0.0.0", 8080).await.unwrap(), 8080);
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (ping_tx, ping_rx) = oneshot::channel();
        let (fwd_tx, fwd_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::Ping { reply_tx: ping_tx })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::TcpipForward {
                address: "0.0.0.0".into(),
                port: 22,
                reply_tx: fwd_tx,
            })
            .await
            .unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(fwd_rx.await.unwrap().is_err());
        assert!(cmd_tx.is_closed());
    }
}
