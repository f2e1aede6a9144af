//! In-process fakes for the transport and filesystem seams

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::session::reconnect::Scheduler;
use crate::sftp::engine::RemoteFsProvider;
use crate::sftp::error::TransferError;
use crate::sftp::fs::{BoxedReader, BoxedWriter, DirEntry, FileStat, FileSystem, LocalFs};
use crate::ssh::config::{AuthMethod, HostKeyPolicy, SshConfig};
use crate::ssh::transport::{
    BoxedStream, ChannelCommand, ChannelEvent, ChannelIo, ConnectionSource, Connector,
    InboundForward, PingResult, PtyRequest, SshConnection,
};
use crate::ssh::SshError;

pub fn ssh_config(host: &str) -> SshConfig {
    SshConfig {
        host: host.to_string(),
        port: 22,
        username: "tester".to_string(),
        auth: AuthMethod::password("secret"),
        host_key: HostKeyPolicy::AcceptNew,
    }
}

/// `SshError` is not `Clone` because of its io variant
fn replay(err: &SshError) -> SshError {
    match err {
        SshError::AuthenticationFailed(m) => SshError::AuthenticationFailed(m.clone()),
        SshError::ConnectionFailed(m) => SshError::ConnectionFailed(m.clone()),
        SshError::Timeout(m) => SshError::Timeout(m.clone()),
        SshError::ChannelOpen(m) => SshError::ChannelOpen(m.clone()),
        SshError::Bind { addr, reason } => SshError::Bind {
            addr: addr.clone(),
            reason: reason.clone(),
        },
        SshError::Tunnel(m) => SshError::Tunnel(m.clone()),
        SshError::Exec(m) => SshError::Exec(m.clone()),
        SshError::ProtocolError(m) => SshError::ProtocolError(m.clone()),
        SshError::KeyError(m) => SshError::KeyError(m.clone()),
        SshError::SessionNotFound(m) => SshError::SessionNotFound(m.clone()),
        SshError::IoError(e) => SshError::IoError(std::io::Error::new(e.kind(), e.to_string())),
        SshError::Disconnected => SshError::Disconnected,
    }
}

#[derive(Default)]
struct HostScript {
    attempts: usize,
    failures: VecDeque<SshError>,
    always: Option<SshError>,
    hang: bool,
    last: Option<Arc<FakeConnection>>,
}

/// Scriptable `Connector`. Every successful connect yields a fresh
/// `FakeConnection` reachable through `last(host)`.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, HostScript>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next connect to `host` once
    pub fn fail_next(&self, host: &str, err: SshError) {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_default()
            .failures
            .push_back(err);
    }

    pub fn fail_always(&self, host: &str, err: SshError) {
        self.hosts.lock().entry(host.to_string()).or_default().always = Some(err);
    }

    /// Connects to `host` never complete
    pub fn hang(&self, host: &str) {
        self.hosts.lock().entry(host.to_string()).or_default().hang = true;
    }

    pub fn attempts(&self, host: &str) -> usize {
        self.hosts.lock().get(host).map(|h| h.attempts).unwrap_or(0)
    }

    pub fn last(&self, host: &str) -> Option<Arc<FakeConnection>> {
        self.hosts.lock().get(host).and_then(|h| h.last.clone())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        config: &SshConfig,
        via: Option<Arc<dyn SshConnection>>,
    ) -> Result<Arc<dyn SshConnection>, SshError> {
        let hang = {
            let mut hosts = self.hosts.lock();
            let script = hosts.entry(config.host.clone()).or_default();
            script.attempts += 1;
            if let Some(err) = script.failures.pop_front() {
                return Err(err);
            }
            if let Some(err) = &script.always {
                return Err(replay(err));
            }
            script.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let conn = FakeConnection::new(&config.host);
        conn.tunnelled.store(via.is_some(), Ordering::SeqCst);
        if let Some(script) = self.hosts.lock().get_mut(&config.host) {
            script.last = Some(conn.clone());
        }
        Ok(conn)
    }
}

#[derive(Clone)]
struct ExecScript {
    stdout: String,
    stderr: String,
    exit_code: u32,
}

/// In-memory connection: shells and direct-tcpip channels echo, exec
/// channels replay scripts, remote forwards are fed by `inject_forward`.
pub struct FakeConnection {
    host: String,
    connected: AtomicBool,
    tunnelled: AtomicBool,
    refuse_channels: AtomicBool,
    refuse_forwards: AtomicBool,
    ping: Mutex<PingResult>,
    transport: CancellationToken,
    shell_kill: Mutex<CancellationToken>,
    disconnect_tx: broadcast::Sender<()>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
    exec_scripts: Mutex<HashMap<String, Option<ExecScript>>>,
    open_execs: Arc<AtomicUsize>,
    direct_targets: Mutex<Vec<(String, u16)>>,
    direct_origins: Mutex<Vec<String>>,
    forwards: Mutex<HashMap<(String, u16), mpsc::Sender<InboundForward>>>,
    cancelled_forwards: Mutex<Vec<(String, u16)>>,
    next_port: AtomicU16,
    sftp_opens: AtomicUsize,
}

impl FakeConnection {
    pub fn new(host: &str) -> Arc<Self> {
        let (disconnect_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            host: host.to_string(),
            connected: AtomicBool::new(true),
            tunnelled: AtomicBool::new(false),
            refuse_channels: AtomicBool::new(false),
            refuse_forwards: AtomicBool::new(false),
            ping: Mutex::new(PingResult::Ok),
            transport: CancellationToken::new(),
            shell_kill: Mutex::new(CancellationToken::new()),
            disconnect_tx,
            resizes: Arc::new(Mutex::new(Vec::new())),
            exec_scripts: Mutex::new(HashMap::new()),
            open_execs: Arc::new(AtomicUsize::new(0)),
            direct_targets: Mutex::new(Vec::new()),
            direct_origins: Mutex::new(Vec::new()),
            forwards: Mutex::new(HashMap::new()),
            cancelled_forwards: Mutex::new(Vec::new()),
            next_port: AtomicU16::new(40000),
            sftp_opens: AtomicUsize::new(0),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Simulate the network dropping underneath the session
    pub fn drop_transport(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.transport.cancel();
            self.forwards.lock().clear();
            let _ = self.disconnect_tx.send(());
        }
    }

    pub fn set_ping(&self, result: PingResult) {
        *self.ping.lock() = result;
    }

    pub fn tunnelled(&self) -> bool {
        self.tunnelled.load(Ordering::SeqCst)
    }

    pub fn refuse_channels(&self, refuse: bool) {
        self.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_forwards(&self, refuse: bool) {
        self.refuse_forwards.store(refuse, Ordering::SeqCst);
    }

    /// Server closes every open shell
    pub fn close_shells(&self) {
        let mut kill = self.shell_kill.lock();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }

    pub fn script_exec(&self, command: &str, stdout: &str, stderr: &str, exit_code: u32) {
        self.exec_scripts.lock().insert(
            command.to_string(),
            Some(ExecScript {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            }),
        );
    }

    /// `command` runs until its channel is closed
    pub fn hang_exec(&self, command: &str) {
        self.exec_scripts.lock().insert(command.to_string(), None);
    }

    pub fn open_exec_channels(&self) -> usize {
        self.open_execs.load(Ordering::SeqCst)
    }

    pub fn direct_targets(&self) -> Vec<(String, u16)> {
        self.direct_targets.lock().clone()
    }

    /// Originator hosts reported on direct-tcpip opens
    pub fn direct_origins(&self) -> Vec<String> {
        self.direct_origins.lock().clone()
    }

    pub fn cancelled_forwards(&self) -> Vec<(String, u16)> {
        self.cancelled_forwards.lock().clone()
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }

    /// Play a client connecting to the server-side listener of a remote
    /// forward. Returns that client's end of the stream.
    pub async fn inject_forward(&self, address: &str, port: u16) -> Option<DuplexStream> {
        let tx = self.forwards.lock().get(&(address.to_string(), port)).cloned()?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        tx.send(InboundForward {
            stream: Box::new(server),
            originator_host: "203.0.113.7".to_string(),
            originator_port: 50000,
        })
        .await
        .ok()?;
        Some(client)
    }

    fn check_channel(&self) -> Result<(), SshError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        if self.refuse_channels.load(Ordering::SeqCst) {
            return Err(SshError::ChannelOpen("administratively prohibited".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SshConnection for FakeConnection {
    async fn open_shell(&self, _pty: PtyRequest) -> Result<ChannelIo, SshError> {
        self.check_channel()?;
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let transport = self.transport.clone();
        let kill = self.shell_kill.lock().clone();
        let resizes = self.resizes.clone();

        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = transport.cancelled() => break,
                    _ = kill.cancelled() => break,
                    cmd = cmd_rx.recv() => cmd,
                };
                match cmd {
                    Some(ChannelCommand::Data(data)) => {
                        if event_tx.send(ChannelEvent::Data(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(ChannelCommand::Resize { cols, rows }) => resizes.lock().push((cols, rows)),
                    Some(ChannelCommand::Eof) => {}
                    Some(ChannelCommand::Close) | None => break,
                }
            }
            let _ = event_tx.send(ChannelEvent::Closed).await;
        });

        Ok(ChannelIo {
            commands: cmd_tx,
            events: event_rx,
        })
    }

    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError> {
        self.check_channel()
            .map_err(|e| SshError::Exec(e.to_string()))?;
        let script = self
            .exec_scripts
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_else(|| {
                Some(ExecScript {
                    stdout: format!("{}\n", self.host),
                    stderr: String::new(),
                    exit_code: 0,
                })
            });

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(8);
        let (event_tx, event_rx) = mpsc::channel(16);
        let transport = self.transport.clone();
        let open = self.open_execs.clone();
        open.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            match script {
                Some(script) => {
                    if !script.stdout.is_empty() {
                        let _ = event_tx
                            .send(ChannelEvent::Data(Bytes::from(script.stdout)))
                            .await;
                    }
                    if !script.stderr.is_empty() {
                        let _ = event_tx
                            .send(ChannelEvent::ExtendedData {
                                data: Bytes::from(script.stderr),
                                ext: 1,
                            })
                            .await;
                    }
                    let _ = event_tx.send(ChannelEvent::ExitStatus(script.exit_code)).await;
                    let _ = event_tx.send(ChannelEvent::Eof).await;
                }
                None => loop {
                    tokio::select! {
                        _ = transport.cancelled() => break,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ChannelCommand::Close) | None => break,
                            Some(_) => {}
                        },
                    }
                },
            }
            let _ = event_tx.send(ChannelEvent::Closed).await;
            open.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(ChannelIo {
            commands: cmd_tx,
            events: event_rx,
        })
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        _originator_port: u16,
    ) -> Result<BoxedStream, SshError> {
        self.check_channel()?;
        self.direct_targets.lock().push((host.to_string(), port));
        self.direct_origins.lock().push(originator_host.to_string());

        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = tokio::select! {
                    _ = transport.cancelled() => break,
                    r = theirs.read(&mut buf) => match r {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    },
                };
                if theirs.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = theirs.shutdown().await;
        });
        Ok(Box::new(ours))
    }

    async fn request_remote_forward(
        &self,
        address: &str,
        port: u16,
    ) -> Result<(u16, mpsc::Receiver<InboundForward>), SshError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        if self.refuse_forwards.load(Ordering::SeqCst) {
            return Err(SshError::ProtocolError("tcpip-forward request denied".to_string()));
        }
        let bound = if port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            port
        };
        let (tx, rx) = mpsc::channel(16);
        self.forwards.lock().insert((address.to_string(), bound), tx);
        Ok((bound, rx))
    }

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.forwards.lock().remove(&(address.to_string(), port));
        self.cancelled_forwards
            .lock()
            .push((address.to_string(), port));
        Ok(())
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError> {
        self.check_channel()?;
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LocalFs))
    }

    async fn ping(&self) -> PingResult {
        if !self.connected.load(Ordering::SeqCst) {
            return PingResult::IoError;
        }
        *self.ping.lock()
    }

    async fn disconnect(&self) {
        self.drop_transport();
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connection source whose connection the test swaps by hand
#[derive(Default)]
pub struct StaticSource {
    conn: Mutex<Option<Arc<FakeConnection>>>,
}

impl StaticSource {
    pub fn new(conn: Arc<FakeConnection>) -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, conn: Arc<FakeConnection>) {
        *self.conn.lock() = Some(conn);
    }

    pub fn clear(&self) {
        self.conn.lock().take();
    }
}

impl ConnectionSource for StaticSource {
    fn current(&self) -> Result<Arc<dyn SshConnection>, SshError> {
        match self.conn.lock().clone() {
            Some(conn) => Ok(conn),
            None => Err(SshError::Disconnected),
        }
    }
}

/// Scheduler that records delays instead of sleeping
#[derive(Default)]
pub struct InstantScheduler {
    delays: Mutex<Vec<Duration>>,
    block: bool,
}

impl InstantScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every sleep pends forever
    pub fn blocking() -> Arc<Self> {
        Arc::new(Self {
            delays: Mutex::new(Vec::new()),
            block: true,
        })
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Scheduler for InstantScheduler {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
        if self.block {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
    }
}

/// Serves a local filesystem as the remote side
pub struct LocalRemote {
    fs: Arc<dyn FileSystem>,
}

impl LocalRemote {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl RemoteFsProvider for LocalRemote {
    async fn remote_fs(&self) -> Result<Arc<dyn FileSystem>, TransferError> {
        Ok(self.fs.clone())
    }
}

/// `LocalFs` whose reads and writes each wait `delay` first
pub struct SlowFs {
    delay: Duration,
}

impl SlowFs {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FileSystem for SlowFs {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransferError> {
        LocalFs.stat(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransferError> {
        LocalFs.create_dir(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransferError> {
        LocalFs.read_dir(path).await
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, TransferError> {
        let inner = LocalFs.open_read(path, offset).await?;
        Ok(Box::new(Throttled::new(inner, self.delay)))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransferError> {
        let inner = LocalFs.open_write(path).await?;
        Ok(Box::new(Throttled::new(inner, self.delay)))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        LocalFs.remove_file(path).await
    }

    fn join(&self, dir: &str, name: &str) -> String {
        LocalFs.join(dir, name)
    }
}

struct Throttled<T> {
    inner: T,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<T> Throttled<T> {
    fn new(inner: T, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            sleep: None,
        }
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let delay = self.delay;
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.sleep = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.poll_delay(cx).is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.poll_delay(cx).is_pending() {
            return Poll::Pending;
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// TCP echo server on an ephemeral localhost port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}
