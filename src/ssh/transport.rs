//! Transport seam
//!
//! Everything above the SSH layer talks to a live connection through
//! `SshConnection` and establishes connections through `Connector`. The
//! russh-backed implementations live in `client` and `handle_owner`.
//!
//! Channels are exposed as a pair of bounded mpsc queues (`ChannelIo`)
//! owned by a per-channel pump task, so one slow consumer only ever
//! stalls its own channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use super::config::SshConfig;
use super::error::SshError;
use crate::sftp::fs::FileSystem;

/// Ping result, distinguishing failure causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply within the probe deadline
    Timeout,
    /// Transport is gone
    IoError,
}

/// Byte stream carried by an SSH channel (direct-tcpip, forwarded-tcpip)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl PtyRequest {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols,
            rows,
        }
    }
}

/// Requests flowing to a channel's pump task
#[derive(Debug)]
pub enum ChannelCommand {
    Data(Bytes),
    Resize { cols: u32, rows: u32 },
    Eof,
    Close,
}

/// Messages flowing out of a channel's pump task, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Data(Bytes),
    /// `ext == 1` is stderr
    ExtendedData { data: Bytes, ext: u32 },
    ExitStatus(u32),
    Eof,
    Closed,
}

/// Both ends of one session channel
pub struct ChannelIo {
    pub commands: mpsc::Sender<ChannelCommand>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// A connection the server opened towards one of our remote forwards
pub struct InboundForward {
    pub stream: BoxedStream,
    pub originator_host: String,
    pub originator_port: u32,
}

/// One live, authenticated SSH connection
#[async_trait]
pub trait SshConnection: Send + Sync {
    /// Open a pty-backed interactive shell channel
    async fn open_shell(&self, pty: PtyRequest) -> Result<ChannelIo, SshError>;

    /// Open a one-shot exec channel running `command`
    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError>;

    /// Open a direct-tcpip channel to `host:port` as a raw stream
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream, SshError>;

    /// Ask the server to listen on `address:port`. Returns the bound port
    /// and the queue incoming connections are delivered on.
    async fn request_remote_forward(
        &self,
        address: &str,
        port: u16,
    ) -> Result<(u16, mpsc::Receiver<InboundForward>), SshError>;

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), SshError>;

    /// Open the SFTP subsystem on a fresh channel
    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError>;

    async fn ping(&self) -> PingResult;

    async fn disconnect(&self);

    /// Fires once when the transport closes, for whatever reason
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    fn is_connected(&self) -> bool;
}

/// Establishes authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `config`, tunnelling through `via` when present
    async fn connect(
        &self,
        config: &SshConfig,
        via: Option<Arc<dyn SshConnection>>,
    ) -> Result<Arc<dyn SshConnection>, SshError>;
}

/// Hands out a session's current connection, which changes across reconnects
pub trait ConnectionSource: Send + Sync {
    fn current(&self) -> Result<Arc<dyn SshConnection>, SshError>;
}
