//! Session Registry
//!
//! Owns every live session. Each entry is a `SessionBundle`: the
//! connection supervisor plus the channel multiplexer, tunnel manager and
//! transfer engine multiplexed over its connection. The registry is the
//! only thing the UI boundary talks to; bulk operations fan out into
//! independent per-session calls.
//!
//! A lifecycle watcher per session follows the supervisor:
//! - RECONNECTING: shells are closed and remote forwards suspended
//! - CONNECTED again: the primary shell is reopened, remote forwards resumed
//! - DISCONNECTED: channels, tunnels, transfers and transport are torn down
//!   in that order, once, and the session leaves the registry

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::ser::SerializeStruct;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channels::{ChannelError, ChannelHandle, ChannelMultiplexer, ExecOutput};
use super::events::{EventEmitter, EventSink};
use super::reconnect::{Scheduler, TokioScheduler};
use super::state::ConnectionState;
use crate::config::settings::EngineSettings;
use crate::config::vault::{CredentialVault, VaultError};
use crate::forwarding::TunnelManager;
use crate::sftp::engine::{RemoteFsProvider, TransferEngine};
use crate::sftp::error::TransferError;
use crate::sftp::fs::{FileSystem, LocalFs};
use crate::ssh::config::{
    AuthConfig, AuthMethod, EndpointConfig, HostKeyPolicy, SecretValue, SessionConfig, SshConfig,
};
use crate::ssh::error::ErrorKind;
use crate::ssh::supervisor::{ConnectionSupervisor, SupervisorOptions};
use crate::ssh::transport::{ConnectionSource, Connector, SshConnection};
use crate::ssh::{RusshConnector, SshError};

/// Default maximum concurrent sessions
const DEFAULT_MAX_SESSIONS: usize = 20;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(u32),

    #[error("Forward not found: {0}")]
    ForwardNotFound(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    #[error("Connection limit reached: {current}/{max}")]
    ConnectionLimitReached { current: usize, max: usize },

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Channel(ChannelError),

    #[error(transparent)]
    Transfer(TransferError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::SessionNotFound(_)
            | RegistryError::ChannelNotFound(_)
            | RegistryError::ForwardNotFound(_)
            | RegistryError::TransferNotFound(_) => ErrorKind::NotFound,
            RegistryError::ConnectionLimitReached { .. } => ErrorKind::InvalidState,
            RegistryError::Vault(e) => e.kind(),
            RegistryError::Ssh(e) => e.kind(),
            RegistryError::Channel(e) => e.kind(),
            RegistryError::Transfer(e) => e.kind(),
        }
    }
}

impl From<ChannelError> for RegistryError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotFound(id) => RegistryError::ChannelNotFound(id),
            ChannelError::Ssh(e) => RegistryError::Ssh(e),
            other => RegistryError::Channel(other),
        }
    }
}

impl From<TransferError> for RegistryError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::UnknownTransfer(id) => RegistryError::TransferNotFound(id),
            other => RegistryError::Transfer(other),
        }
    }
}

impl Serialize for RegistryError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RegistryError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// What a disconnect tore down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseReport {
    pub channels: usize,
    pub forwards: usize,
    pub transfers: usize,
}

/// Session summary for the UI boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<String>,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub auto_reconnect: bool,
    pub channel_count: usize,
    pub forward_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of one session's share of a fan-out exec
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExecResult {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SshError>,
}

/// Opens one SFTP subsystem per connection and reuses it until the
/// session reconnects
struct SftpProvider {
    source: Arc<dyn ConnectionSource>,
    cache: tokio::sync::Mutex<Option<(Arc<dyn SshConnection>, Arc<dyn FileSystem>)>>,
}

impl SftpProvider {
    fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            cache: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl RemoteFsProvider for SftpProvider {
    async fn remote_fs(&self) -> Result<Arc<dyn FileSystem>, TransferError> {
        let conn = self
            .source
            .current()
            .map_err(|_| TransferError::SessionClosed)?;

        let mut cache = self.cache.lock().await;
        if let Some((cached_conn, fs)) = cache.as_ref() {
            if Arc::ptr_eq(cached_conn, &conn) {
                return Ok(fs.clone());
            }
        }

        let fs = conn
            .open_sftp()
            .await
            .map_err(|e| TransferError::Io(format!("SFTP unavailable: {}", e)))?;
        *cache = Some((conn, fs.clone()));
        Ok(fs)
    }
}

/// One live session and everything multiplexed over its connection
pub struct SessionBundle {
    id: String,
    order: u64,
    created_at: DateTime<Utc>,
    endpoint: (String, u16, String),
    jump_host: Option<String>,
    cols: u32,
    rows: u32,
    stream_output: bool,
    exec_timeout: Duration,
    supervisor: Arc<ConnectionSupervisor>,
    channels: ChannelMultiplexer,
    tunnels: TunnelManager,
    transfers: TransferEngine,
    closed: AtomicBool,
    report: Mutex<Option<CloseReport>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionBundle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn channels(&self) -> &ChannelMultiplexer {
        &self.channels
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            host: self.endpoint.0.clone(),
            port: self.endpoint.1,
            username: self.endpoint.2.clone(),
            jump_host: self.jump_host.clone(),
            state: self.supervisor.state(),
            retry_count: self.supervisor.retry_count(),
            auto_reconnect: self.supervisor.auto_reconnect(),
            channel_count: self.channels.count(),
            forward_count: self.tunnels.count(),
            created_at: self.created_at,
            last_error: self.supervisor.last_error(),
        }
    }

    /// Open a shell, piping its output into the sink when the session
    /// streams output
    pub async fn open_shell(&self, cols: u32, rows: u32) -> Result<ChannelHandle, ChannelError> {
        let handle = self.channels.open_shell(cols, rows).await?;
        if self.stream_output {
            self.channels.pipe_shell_output(handle.channel_id)?;
        }
        Ok(handle)
    }

    pub async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput, SshError> {
        self.channels
            .exec_command(command, timeout.unwrap_or(self.exec_timeout))
            .await
    }

    /// Tear everything down in dependency order. Runs once; later calls
    /// return the first report.
    async fn close(&self) -> CloseReport {
        if self.closed.swap(true, Ordering::SeqCst) {
            let report = *self.report.lock();
            return report.unwrap_or_default();
        }

        let channels = self.channels.close_all();
        let forwards = self.tunnels.stop_all().await;
        let transfers = self.transfers.shutdown().await;
        self.supervisor.close_transport().await;

        let report = CloseReport {
            channels,
            forwards,
            transfers,
        };
        *self.report.lock() = Some(report);
        info!(
            "Session {} closed: {} channels, {} forwards, {} transfers",
            self.id, channels, forwards, transfers
        );
        report
    }
}

/// Top-level map from session id to its bundle
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<SessionBundle>>>,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    vault: RwLock<Option<Arc<CredentialVault>>>,
    settings: EngineSettings,
    order_counter: AtomicU64,
    max_sessions: AtomicUsize,
    /// Connects in flight, counted against `max_sessions`
    connecting: AtomicUsize,
}

/// A reserved place under the session limit, released on drop
struct ConnectSlot<'a>(&'a AtomicUsize);

impl Drop for ConnectSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            connector,
            scheduler,
            vault: RwLock::new(None),
            settings,
            order_counter: AtomicU64::new(0),
            max_sessions: AtomicUsize::new(DEFAULT_MAX_SESSIONS),
            connecting: AtomicUsize::new(0),
        }
    }

    /// Registry backed by russh and real timers
    pub fn with_settings(settings: EngineSettings) -> Self {
        let connector = Arc::new(RusshConnector::new(settings.channel_buffer));
        Self::new(connector, Arc::new(TokioScheduler), settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_vault(&self, vault: Option<Arc<CredentialVault>>) {
        *self.vault.write() = vault;
    }

    pub fn vault(&self) -> Option<Arc<CredentialVault>> {
        self.vault.read().clone()
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::SeqCst);
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionBundle>, RegistryError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))
    }

    /// Every session in the order it connected
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut bundles: Vec<Arc<SessionBundle>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        bundles.sort_by_key(|b| b.order);
        bundles.iter().map(|b| b.info()).collect()
    }

    /// Claim a place for one more session. The slot must outlive the
    /// session's insertion so the count never dips in between.
    fn reserve_slot(&self) -> Result<ConnectSlot<'_>, RegistryError> {
        let ahead = self.connecting.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectSlot(&self.connecting);
        let current = self.sessions.len() + ahead;
        let max = self.max_sessions();
        if current >= max {
            return Err(RegistryError::ConnectionLimitReached { current, max });
        }
        Ok(slot)
    }

    fn open_secret(&self, secret: &SecretValue) -> Result<String, VaultError> {
        match secret {
            SecretValue::Plain(value) => Ok(value.clone()),
            SecretValue::Sealed(record) => {
                let vault = self.vault().ok_or(VaultError::Locked)?;
                let opened = vault.open(record)?;
                Ok(opened.as_str().to_string())
            }
        }
    }

    fn resolve(&self, endpoint: &EndpointConfig, host_key: &HostKeyPolicy) -> Result<SshConfig, VaultError> {
        let auth = match &endpoint.auth {
            AuthConfig::Password { password } => AuthMethod::Password {
                password: self.open_secret(password)?,
            },
            AuthConfig::Key {
                key_path,
                passphrase,
            } => AuthMethod::Key {
                key_path: key_path.clone(),
                passphrase: passphrase
                    .as_ref()
                    .map(|p| self.open_secret(p))
                    .transpose()?,
            },
        };
        Ok(SshConfig {
            host: endpoint.host.clone(),
            port: endpoint.port,
            username: endpoint.username.clone(),
            auth,
            host_key: host_key.clone(),
        })
    }

    /// Establish a session and open its primary shell.
    ///
    /// A failed connect leaves nothing behind. A refused primary shell is
    /// logged and the session stays connected without one.
    pub async fn connect(
        &self,
        config: SessionConfig,
        sink: EventSink,
    ) -> Result<Arc<SessionBundle>, RegistryError> {
        let _slot = self.reserve_slot()?;

        let target = self.resolve(&config.endpoint, &config.host_key)?;
        let jump = config
            .jump
            .as_ref()
            .map(|j| self.resolve(j, &config.host_key))
            .transpose()?;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating session {}: {}@{}{}",
            session_id,
            config.endpoint.username,
            config.endpoint.address(),
            config
                .jump
                .as_ref()
                .map(|j| format!(" via {}", j.address()))
                .unwrap_or_default()
        );

        let emitter = EventEmitter::new(sink, session_id.clone());
        let supervisor = ConnectionSupervisor::new(
            session_id.clone(),
            target,
            jump,
            SupervisorOptions {
                auto_reconnect: config.auto_reconnect,
                timeouts: config.timeouts.clone(),
                backoff: self.settings.reconnect.clone(),
            },
            self.connector.clone(),
            self.scheduler.clone(),
            emitter.clone(),
        );

        // Subscribe first so no transition after connect is missed
        let transitions = supervisor.subscribe_transitions();
        supervisor.connect().await?;

        let source: Arc<dyn ConnectionSource> = supervisor.clone();
        let bundle = Arc::new(SessionBundle {
            id: session_id.clone(),
            order: self.order_counter.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
            endpoint: (
                config.endpoint.host.clone(),
                config.endpoint.port,
                config.endpoint.username.clone(),
            ),
            jump_host: config.jump.as_ref().map(|j| j.address()),
            cols: config.cols,
            rows: config.rows,
            stream_output: config.stream_output,
            exec_timeout: config.timeouts.exec(),
            channels: ChannelMultiplexer::new(
                session_id.clone(),
                source.clone(),
                emitter.clone(),
                self.settings.channel_buffer,
            ),
            tunnels: TunnelManager::new(session_id.clone(), source.clone(), emitter.clone()),
            transfers: TransferEngine::spawn(
                self.settings.transfer.clone(),
                Arc::new(LocalFs),
                Arc::new(SftpProvider::new(source)),
                emitter,
            ),
            supervisor,
            closed: AtomicBool::new(false),
            report: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        self.sessions.insert(session_id.clone(), bundle.clone());
        let watcher = tokio::spawn(watch_lifecycle(
            self.sessions.clone(),
            bundle.clone(),
            transitions,
        ));
        *bundle.watcher.lock() = Some(watcher);

        if let Err(e) = bundle.open_shell(bundle.cols, bundle.rows).await {
            warn!("Session {}: primary shell refused: {}", session_id, e);
        }
        Ok(bundle)
    }

    /// Mark the session DISCONNECTED at once, then tear it down
    pub async fn disconnect(&self, session_id: &str) -> Result<CloseReport, RegistryError> {
        let bundle = self.get(session_id)?;
        bundle.supervisor.mark_disconnected("disconnected by user");
        let report = bundle.close().await;
        self.sessions.remove(session_id);
        if let Some(watcher) = bundle.watcher.lock().take() {
            watcher.abort();
        }
        Ok(report)
    }

    /// Disconnect every session. Returns how many were closed.
    pub async fn disconnect_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        let closes = ids.iter().map(|id| self.disconnect(id));
        futures_util::future::join_all(closes)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }

    /// Run `command` on every CONNECTED session concurrently
    pub async fn run_on_all(&self, command: &str, timeout: Option<Duration>) -> Vec<SessionExecResult> {
        let mut bundles: Vec<Arc<SessionBundle>> = self
            .sessions
            .iter()
            .filter(|s| s.value().state() == ConnectionState::Connected)
            .map(|s| s.value().clone())
            .collect();
        bundles.sort_by_key(|b| b.order);

        let runs = bundles.into_iter().map(|bundle| async move {
            let result = bundle.exec(command, timeout).await;
            let session_id = bundle.id.clone();
            match result {
                Ok(output) => SessionExecResult {
                    session_id,
                    output: Some(output),
                    error: None,
                },
                Err(e) => SessionExecResult {
                    session_id,
                    output: None,
                    error: Some(e),
                },
            }
        });
        futures_util::future::join_all(runs).await
    }
}

/// Follow one session's supervisor until it ends
async fn watch_lifecycle(
    sessions: Arc<DashMap<String, Arc<SessionBundle>>>,
    bundle: Arc<SessionBundle>,
    mut transitions: broadcast::Receiver<ConnectionState>,
) {
    let mut reconnecting = false;
    loop {
        match transitions.recv().await {
            Ok(ConnectionState::Reconnecting) => {
                reconnecting = true;
                let closed = bundle.channels.close_all();
                let suspended = bundle.tunnels.suspend_remote();
                debug!(
                    "Session {} reconnecting: closed {} channels, suspended {} forwards",
                    bundle.id, closed, suspended
                );
            }
            Ok(ConnectionState::Connected) if reconnecting => {
                reconnecting = false;
                if let Err(e) = bundle.open_shell(bundle.cols, bundle.rows).await {
                    warn!("Session {}: could not reopen primary shell: {}", bundle.id, e);
                }
                let resumed = bundle.tunnels.resume_remote().await;
                info!("Session {} restored, {} remote forwards resumed", bundle.id, resumed);
            }
            Ok(ConnectionState::Disconnected) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Session {} watcher skipped {} transitions", bundle.id, skipped);
                if bundle.state().is_terminal() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    bundle.close().await;
    sessions.remove(&bundle.id);
}
