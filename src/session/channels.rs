//! Channel Multiplexer
//!
//! Interactive shells and one-shot exec channels over a session's
//! connection. Each shell gets its own router task that moves the pump's
//! events into a bounded per-channel output queue, so a consumer that falls
//! behind only ever stalls its own channel.
//!
//! Shell output is delivered either pull-style (`on_data`) or pushed into
//! the session's event sink (`pipe_shell_output`); output can be taken once.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::events::EventEmitter;
use crate::ssh::error::ErrorKind;
use crate::ssh::transport::{ChannelCommand, ChannelEvent, ConnectionSource, PtyRequest};
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not found: {0}")]
    NotFound(u32),

    #[error("Channel {0} is closed")]
    Closed(u32),

    #[error("Output of channel {0} is already being consumed")]
    OutputTaken(u32),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::NotFound(_) => ErrorKind::NotFound,
            ChannelError::Closed(_) => ErrorKind::SessionClosed,
            ChannelError::OutputTaken(_) => ErrorKind::InvalidState,
            ChannelError::Ssh(e) => e.kind(),
        }
    }
}

/// Addresses one channel across the UI boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHandle {
    pub session_id: String,
    pub channel_id: u32,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: u32,
    pub primary: bool,
    pub cols: u32,
    pub rows: u32,
}

/// Result of a one-shot command. A nonzero exit is still `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without an exit status
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

struct ShellChannel {
    id: u32,
    primary: bool,
    dims: Mutex<(u32, u32)>,
    commands: mpsc::Sender<ChannelCommand>,
    output: Mutex<Option<mpsc::Receiver<Bytes>>>,
    /// Set once output is pushed to the sink; the pipe task then owns `shell-closed`
    piped: Mutex<bool>,
    closed: AtomicBool,
    closing: CancellationToken,
}

impl ShellChannel {
    /// True exactly once, for whoever closes the channel first
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.closing.cancel();
        first
    }

    fn info(&self) -> ChannelInfo {
        let (cols, rows) = *self.dims.lock();
        ChannelInfo {
            channel_id: self.id,
            primary: self.primary,
            cols,
            rows,
        }
    }
}

/// State shared with the router tasks
struct Shared {
    emitter: EventEmitter,
    channels: DashMap<u32, Arc<ShellChannel>>,
}

impl Shared {
    /// Retire a channel. False if someone else already did.
    fn finalize(&self, channel: &ShellChannel) -> bool {
        if !channel.mark_closed() {
            return false;
        }
        self.channels.remove(&channel.id);
        debug!("Channel {} closed for session {}", channel.id, self.emitter.session_id());
        let piped = channel.piped.lock();
        if !*piped {
            self.emitter.emit_shell_closed(channel.id);
        }
        true
    }
}

/// Ordered output of one shell, ending when the channel closes
pub struct ShellOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl ShellOutput {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for ShellOutput {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

pub struct ChannelMultiplexer {
    session_id: String,
    source: Arc<dyn ConnectionSource>,
    shared: Arc<Shared>,
    next_id: AtomicU32,
    primary: Mutex<Option<u32>>,
    output_buffer: usize,
}

impl ChannelMultiplexer {
    pub fn new(
        session_id: impl Into<String>,
        source: Arc<dyn ConnectionSource>,
        emitter: EventEmitter,
        output_buffer: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            shared: Arc::new(Shared {
                emitter,
                channels: DashMap::new(),
            }),
            next_id: AtomicU32::new(1),
            primary: Mutex::new(None),
            output_buffer: output_buffer.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn channel(&self, channel_id: u32) -> Result<Arc<ShellChannel>, ChannelError> {
        self.shared
            .channels
            .get(&channel_id)
            .map(|c| c.value().clone())
            .ok_or(ChannelError::NotFound(channel_id))
    }

    fn handle(&self, channel: &ShellChannel) -> ChannelHandle {
        ChannelHandle {
            session_id: self.session_id.clone(),
            channel_id: channel.id,
            primary: channel.primary,
        }
    }

    /// Open a pty-backed shell. The first shell of a connection is the
    /// primary one; later calls open split shells.
    pub async fn open_shell(&self, cols: u32, rows: u32) -> Result<ChannelHandle, ChannelError> {
        let conn = self.source.current()?;
        let io = conn.open_shell(PtyRequest::new(cols, rows)).await.map_err(|e| match e {
            SshError::ChannelOpen(_) | SshError::Disconnected => e,
            other => SshError::ChannelOpen(other.to_string()),
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let primary = {
            let mut primary = self.primary.lock();
            if primary.is_none() {
                *primary = Some(id);
                true
            } else {
                false
            }
        };

        let (out_tx, out_rx) = mpsc::channel(self.output_buffer);
        let channel = Arc::new(ShellChannel {
            id,
            primary,
            dims: Mutex::new((cols, rows)),
            commands: io.commands,
            output: Mutex::new(Some(out_rx)),
            piped: Mutex::new(false),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        });
        self.shared.channels.insert(id, channel.clone());
        tokio::spawn(route(self.shared.clone(), channel.clone(), io.events, out_tx));

        info!(
            "Opened {} shell {} for session {}",
            if primary { "primary" } else { "split" },
            id,
            self.session_id
        );
        self.shared.emitter.emit_shell_opened(id, primary);
        Ok(self.handle(&channel))
    }

    /// Send input; no acknowledgement from the remote side
    pub async fn write(&self, channel_id: u32, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        let channel = self.channel(channel_id)?;
        channel
            .commands
            .send(ChannelCommand::Data(data.into()))
            .await
            .map_err(|_| ChannelError::Closed(channel_id))
    }

    pub async fn resize(&self, channel_id: u32, cols: u32, rows: u32) -> Result<(), ChannelError> {
        let channel = self.channel(channel_id)?;
        *channel.dims.lock() = (cols, rows);
        channel
            .commands
            .send(ChannelCommand::Resize { cols, rows })
            .await
            .map_err(|_| ChannelError::Closed(channel_id))
    }

    /// Take the ordered output of a shell. Only one consumer per channel.
    pub fn on_data(&self, channel_id: u32) -> Result<ShellOutput, ChannelError> {
        let channel = self.channel(channel_id)?;
        let rx = channel
            .output
            .lock()
            .take()
            .ok_or(ChannelError::OutputTaken(channel_id))?;
        Ok(ShellOutput { rx })
    }

    /// Push a shell's output into the session sink as `shell-data` events
    ///
    /// `shell-closed` for a piped channel is emitted by the pipe task once the
    /// queued output has been flushed, so it is always the channel's last event.
    pub fn pipe_shell_output(&self, channel_id: u32) -> Result<JoinHandle<()>, ChannelError> {
        let channel = self.channel(channel_id)?;
        let mut piped = channel.piped.lock();
        // Checked under the lock so exactly one side announces the close
        if channel.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(channel_id));
        }
        let rx = channel
            .output
            .lock()
            .take()
            .ok_or(ChannelError::OutputTaken(channel_id))?;
        *piped = true;
        drop(piped);

        let mut output = ShellOutput { rx };
        let emitter = self.shared.emitter.clone();
        Ok(tokio::spawn(async move {
            while let Some(chunk) = output.next_chunk().await {
                emitter.emit_shell_data(channel_id, chunk.to_vec());
            }
            emitter.emit_shell_closed(channel_id);
        }))
    }

    /// Close one shell; siblings and the connection are untouched
    pub fn close(&self, channel_id: u32) -> Result<(), ChannelError> {
        let channel = self.channel(channel_id)?;
        let _ = channel.commands.try_send(ChannelCommand::Close);
        self.shared.finalize(&channel);
        Ok(())
    }

    /// Close every shell. The next shell opened becomes the primary one.
    pub fn close_all(&self) -> usize {
        let mut channels: Vec<Arc<ShellChannel>> = self
            .shared
            .channels
            .iter()
            .map(|c| c.value().clone())
            .collect();
        channels.sort_by_key(|c| c.id);

        let mut closed = 0;
        for channel in channels {
            let _ = channel.commands.try_send(ChannelCommand::Close);
            if self.shared.finalize(&channel) {
                closed += 1;
            }
        }
        *self.primary.lock() = None;
        if closed > 0 {
            info!("Closed {} channels for session {}", closed, self.session_id);
        }
        closed
    }

    pub fn list(&self) -> Vec<ChannelInfo> {
        let mut list: Vec<ChannelInfo> = self.shared.channels.iter().map(|c| c.info()).collect();
        list.sort_by_key(|c| c.channel_id);
        list
    }

    pub fn count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Run `command` on its own channel and collect its output.
    ///
    /// On timeout the channel is closed and `SshError::Timeout` returned.
    pub async fn exec_command(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        let conn = self.source.current()?;
        debug!("Exec on session {}: {}", self.session_id, command);

        let run = async {
            let mut io = conn.open_exec(command).await.map_err(|e| match e {
                SshError::Exec(_) | SshError::Disconnected => e,
                other => SshError::Exec(other.to_string()),
            })?;
            let result = tokio::time::timeout(timeout, collect_exec(&mut io.events)).await;
            if result.is_err() {
                let _ = io.commands.try_send(ChannelCommand::Close);
            }
            Ok::<_, SshError>(result)
        };

        match run.await? {
            Ok(output) => Ok(output),
            Err(_) => {
                warn!(
                    "Exec on session {} timed out after {:?}: {}",
                    self.session_id, timeout, command
                );
                Err(SshError::Timeout(format!(
                    "command did not finish within {}s",
                    timeout.as_secs_f32()
                )))
            }
        }
    }
}

async fn collect_exec(events: &mut mpsc::Receiver<ChannelEvent>) -> ExecOutput {
    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    let mut exit_code = None;

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(data) => stdout.extend_from_slice(&data),
            ChannelEvent::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelEvent::ExtendedData { .. } | ChannelEvent::Eof => {}
            ChannelEvent::ExitStatus(code) => exit_code = Some(code),
            ChannelEvent::Closed => break,
        }
    }

    ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    }
}

/// Move one shell's pump events into its output queue, in order
async fn route(
    shared: Arc<Shared>,
    channel: Arc<ShellChannel>,
    mut events: mpsc::Receiver<ChannelEvent>,
    out: mpsc::Sender<Bytes>,
) {
    loop {
        let event = tokio::select! {
            _ = channel.closing.cancelled() => break,
            event = events.recv() => event,
        };
        let chunk = match event {
            Some(ChannelEvent::Data(data)) => data,
            Some(ChannelEvent::ExtendedData { data, .. }) => data,
            Some(ChannelEvent::Eof) | Some(ChannelEvent::ExitStatus(_)) => continue,
            Some(ChannelEvent::Closed) | None => break,
        };
        if out.is_closed() {
            // Consumer went away; keep draining so the pump never stalls
            continue;
        }
        tokio::select! {
            _ = channel.closing.cancelled() => break,
            _ = out.send(chunk) => {}
        }
    }
    shared.finalize(&channel);
}
