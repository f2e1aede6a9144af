//! Channel pump for russh session channels
//!
//! One task owns each `Channel<Msg>`. It multiplexes outbound commands and
//! inbound channel messages in a single `select!` loop and publishes the
//! inbound side, in order, on a bounded queue.

use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::transport::{ChannelCommand, ChannelEvent, ChannelIo, PtyRequest};

const COMMAND_BUFFER: usize = 256;

/// Request a pty and shell on `channel`, then hand it to a pump task
pub async fn start_shell(
    channel: Channel<Msg>,
    pty: &PtyRequest,
    label: String,
    buffer: usize,
) -> Result<ChannelIo, SshError> {
    channel
        .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelOpen(format!("PTY request failed: {}", e)))?;

    debug!("PTY allocated for {}, requesting shell", label);

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelOpen(format!("Shell request failed: {}", e)))?;

    info!("Interactive shell started for {}", label);
    Ok(spawn_channel_pump(channel, label, buffer))
}

/// Run `command` on `channel`, then hand it to a pump task
pub async fn start_exec(
    channel: Channel<Msg>,
    command: &str,
    label: String,
    buffer: usize,
) -> Result<ChannelIo, SshError> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::Exec(format!("exec request failed: {}", e)))?;
    Ok(spawn_channel_pump(channel, label, buffer))
}

pub fn spawn_channel_pump(mut channel: Channel<Msg>, label: String, buffer: usize) -> ChannelIo {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(buffer.max(1));

    tokio::spawn(async move {
        debug!("Channel pump started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data on {}: {}", label, e);
                                break;
                            }
                        }
                        Some(ChannelCommand::Resize { cols, rows }) => {
                            // A failed resize leaves the channel usable
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                error!("Failed to resize {}: {}", label, e);
                            } else {
                                debug!("Resized {} to {}x{}", label, cols, rows);
                            }
                        }
                        Some(ChannelCommand::Eof) => {
                            let _ = channel.eof().await;
                        }
                        Some(ChannelCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    let event = match msg {
                        Some(ChannelMsg::Data { data }) => ChannelEvent::Data(Bytes::copy_from_slice(&data)),
                        Some(ChannelMsg::ExtendedData { data, ext }) => ChannelEvent::ExtendedData {
                            data: Bytes::copy_from_slice(&data),
                            ext,
                        },
                        Some(ChannelMsg::ExitStatus { exit_status }) => ChannelEvent::ExitStatus(exit_status),
                        Some(ChannelMsg::Eof) => ChannelEvent::Eof,
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => continue,
                    };
                    if event_tx.send(event).await.is_err() {
                        debug!("Receiver for {} dropped", label);
                        let _ = channel.close().await;
                        break;
                    }
                }
            }
        }

        let _ = event_tx.send(ChannelEvent::Closed).await;
        info!("Channel pump terminated for {}", label);
    });

    ChannelIo {
        commands: cmd_tx,
        events: event_rx,
    }
}
