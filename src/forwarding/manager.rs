//! Port Forwarding Manager
//!
//! Centralized management for all tunnels of one session: creation,
//! status tracking, stats, and teardown. Every change is reported to the
//! session's event sink as `forward-status-changed` plus a fresh
//! `forward-list-changed`.
//!
//! Local and dynamic listeners outlive reconnects since they look up the
//! current connection per client. Remote forwards live on the server and
//! are suspended while the session reconnects, then requested again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::bridge::{bind_listener, ForwardContext, ForwardStats, StatsCounter};
use super::dynamic::spawn_dynamic_forward;
use super::local::{spawn_local_forward, LocalTarget};
use super::remote::{request_remote_forward, spawn_remote_pump, RemoteForward};
use crate::session::events::EventEmitter;
use crate::ssh::transport::ConnectionSource;
use crate::ssh::SshError;

/// How long `stop` waits for a tunnel's tasks and connections to wind down
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Type of port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
    /// Local port forwarding (-L)
    Local,
    /// Remote port forwarding (-R)
    Remote,
    /// Dynamic SOCKS proxy (-D)
    Dynamic,
}

/// Status of a port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    /// Forward is active and running
    Active,
    /// Waiting for the session to reconnect
    Suspended,
    /// Forward has stopped
    Stopped,
    /// Forward could not be restored
    Error,
}

/// Snapshot of one tunnel, as shown to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub forward_type: ForwardType,
    pub bind_host: String,
    pub bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    pub status: ForwardStatus,
    pub active_connection_count: u64,
    pub stats: ForwardStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TunnelState {
    status: ForwardStatus,
    error: Option<String>,
    /// Accept loop or remote pump of the current generation
    task: Option<JoinHandle<()>>,
    /// Remote forwards only: cancels the pump bound to the old transport
    generation: Option<CancellationToken>,
}

struct Tunnel {
    id: String,
    seq: u64,
    forward_type: ForwardType,
    bind_host: String,
    /// Actual bound port (local listener or server-side listener)
    bind_port: u16,
    target: Option<(String, u16)>,
    stats: Arc<StatsCounter>,
    cancel: CancellationToken,
    state: Mutex<TunnelState>,
}

impl Tunnel {
    fn info(&self, session_id: &str) -> TunnelInfo {
        let state = self.state.lock();
        let stats = self.stats.snapshot();
        TunnelInfo {
            id: self.id.clone(),
            session_id: session_id.to_string(),
            forward_type: self.forward_type,
            bind_host: self.bind_host.clone(),
            bind_port: self.bind_port,
            target_host: self.target.as_ref().map(|(h, _)| h.clone()),
            target_port: self.target.as_ref().map(|(_, p)| *p),
            status: state.status,
            active_connection_count: stats.active_connections,
            stats,
            error: state.error.clone(),
        }
    }

    fn remote_config(&self) -> Option<RemoteForward> {
        let (host, port) = self.target.clone()?;
        (self.forward_type == ForwardType::Remote).then(|| RemoteForward {
            remote_addr: self.bind_host.clone(),
            remote_port: self.bind_port,
            local_host: host,
            local_port: port,
        })
    }
}

/// Port forwarding manager for one session
pub struct TunnelManager {
    session_id: String,
    source: Arc<dyn ConnectionSource>,
    emitter: EventEmitter,
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    next_seq: AtomicU64,
    stop_grace: Duration,
}

impl TunnelManager {
    pub fn new(
        session_id: impl Into<String>,
        source: Arc<dyn ConnectionSource>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            emitter,
            tunnels: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            stop_grace: STOP_GRACE,
        }
    }

    #[cfg(test)]
    fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn context(&self, tunnel: &Tunnel, cancel: &CancellationToken) -> ForwardContext {
        ForwardContext {
            forward_id: tunnel.id.clone(),
            source: self.source.clone(),
            stats: tunnel.stats.clone(),
            cancel: cancel.clone(),
        }
    }

    fn new_tunnel(
        &self,
        forward_type: ForwardType,
        bind_host: &str,
        bind_port: u16,
        target: Option<(String, u16)>,
    ) -> Tunnel {
        Tunnel {
            id: Uuid::new_v4().to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            forward_type,
            bind_host: bind_host.to_string(),
            bind_port,
            target,
            stats: StatsCounter::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(TunnelState {
                status: ForwardStatus::Active,
                error: None,
                task: None,
                generation: None,
            }),
        }
    }

    fn register(&self, tunnel: Tunnel) -> TunnelInfo {
        let info = tunnel.info(&self.session_id);
        self.tunnels.write().insert(tunnel.id.clone(), Arc::new(tunnel));

        self.emitter
            .emit_forward_status(&info.id, ForwardStatus::Active, None);
        self.emit_list();
        info
    }

    /// Listen on `bind_host:bind_port` and forward each client to
    /// `target_host:target_port` through the session
    pub async fn start_local_forward(
        &self,
        bind_host: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<TunnelInfo, SshError> {
        // No listener for a session without a transport
        self.source.current()?;

        let listener = bind_listener(bind_host, bind_port).await?;
        let bound = listener.local_addr()?;
        info!(
            "Creating local forward {} -> {}:{}",
            bound, target_host, target_port
        );

        let tunnel = self.new_tunnel(
            ForwardType::Local,
            bind_host,
            bound.port(),
            Some((target_host.to_string(), target_port)),
        );
        let task = spawn_local_forward(
            listener,
            self.context(&tunnel, &tunnel.cancel),
            LocalTarget {
                host: target_host.to_string(),
                port: target_port,
            },
        );
        tunnel.state.lock().task = Some(task);

        Ok(self.register(tunnel))
    }

    /// Ask the server to listen on `remote_bind_host:remote_bind_port` and
    /// forward its clients to `target_host:target_port` on this machine
    pub async fn start_remote_forward(
        &self,
        remote_bind_port: u16,
        target_host: &str,
        target_port: u16,
        remote_bind_host: &str,
    ) -> Result<TunnelInfo, SshError> {
        let conn = self.source.current()?;
        let mut config = RemoteForward {
            remote_addr: remote_bind_host.to_string(),
            remote_port: remote_bind_port,
            local_host: target_host.to_string(),
            local_port: target_port,
        };
        let (bound_port, inbound) = request_remote_forward(&conn, &config).await?;
        // A reconnect asks for the same port the server handed out
        config.remote_port = bound_port;

        let tunnel = self.new_tunnel(
            ForwardType::Remote,
            remote_bind_host,
            bound_port,
            Some((target_host.to_string(), target_port)),
        );
        let generation = tunnel.cancel.child_token();
        let task = spawn_remote_pump(inbound, self.context(&tunnel, &generation), config);
        {
            let mut state = tunnel.state.lock();
            state.task = Some(task);
            state.generation = Some(generation);
        }

        Ok(self.register(tunnel))
    }

    /// Run a SOCKS5 proxy on `bind_host:bind_port`
    pub async fn start_dynamic_forward(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<TunnelInfo, SshError> {
        self.source.current()?;

        let listener = bind_listener(bind_host, bind_port).await?;
        let bound = listener.local_addr()?;
        info!("Creating dynamic (SOCKS5) forward on {}", bound);

        let tunnel = self.new_tunnel(ForwardType::Dynamic, bind_host, bound.port(), None);
        let task = spawn_dynamic_forward(listener, self.context(&tunnel, &tunnel.cancel));
        tunnel.state.lock().task = Some(task);

        Ok(self.register(tunnel))
    }

    /// Tear one tunnel down; the entry is gone afterwards
    async fn teardown(&self, tunnel: &Tunnel) {
        let deadline = tokio::time::Instant::now() + self.stop_grace;
        if let Some(config) = tunnel.remote_config() {
            let suspended = tunnel.state.lock().status == ForwardStatus::Suspended;
            if !suspended {
                if let Ok(conn) = self.source.current() {
                    let cancel = conn.cancel_remote_forward(&config.remote_addr, config.remote_port);
                    match tokio::time::timeout_at(deadline, cancel).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Failed to cancel remote forward: {}", e),
                        Err(_) => warn!("Server did not answer cancel for forward {}", tunnel.id),
                    }
                }
            }
        }

        tunnel.cancel.cancel();
        let task = {
            let mut state = tunnel.state.lock();
            state.status = ForwardStatus::Stopped;
            state.task.take()
        };
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Forward {} task did not exit in time, aborting", tunnel.id);
                task.abort();
            }
        }

        while tunnel.stats.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Timeout waiting for {} active connections to close on forward {}",
                    tunnel.stats.active(),
                    tunnel.id
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.emitter
            .emit_forward_status(&tunnel.id, ForwardStatus::Stopped, None);
    }

    /// Stop a tunnel and close its forwarded connections. Returns false if
    /// no such tunnel exists.
    pub async fn stop(&self, forward_id: &str) -> bool {
        let Some(tunnel) = self.tunnels.write().remove(forward_id) else {
            return false;
        };
        self.teardown(&tunnel).await;
        info!("Stopped forward {} for session {}", forward_id, self.session_id);
        self.emit_list();
        true
    }

    /// Stop every tunnel. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut tunnels: Vec<Arc<Tunnel>> = self.tunnels.write().drain().map(|(_, t)| t).collect();
        if tunnels.is_empty() {
            return 0;
        }
        tunnels.sort_by_key(|t| t.seq);
        info!(
            "Stopping {} forwards for session {}",
            tunnels.len(),
            self.session_id
        );

        for tunnel in &tunnels {
            self.teardown(tunnel).await;
        }
        self.emit_list();
        tunnels.len()
    }

    /// The session lost its transport: server-side listeners are gone
    pub fn suspend_remote(&self) -> usize {
        let mut suspended = 0;
        for tunnel in self.sorted() {
            if tunnel.forward_type != ForwardType::Remote {
                continue;
            }
            {
                let mut state = tunnel.state.lock();
                if state.status != ForwardStatus::Active {
                    continue;
                }
                if let Some(generation) = state.generation.take() {
                    generation.cancel();
                }
                state.task = None;
                state.status = ForwardStatus::Suspended;
            }
            self.emitter.emit_forward_status(
                &tunnel.id,
                ForwardStatus::Suspended,
                Some("SSH connection lost".into()),
            );
            suspended += 1;
        }
        if suspended > 0 {
            self.emit_list();
        }
        suspended
    }

    /// Request suspended remote forwards again on the new transport.
    /// Returns how many were restored.
    pub async fn resume_remote(&self) -> usize {
        let suspended: Vec<Arc<Tunnel>> = self
            .sorted()
            .into_iter()
            .filter(|t| t.state.lock().status == ForwardStatus::Suspended)
            .collect();
        if suspended.is_empty() {
            return 0;
        }

        let mut restored = 0;
        for tunnel in suspended {
            let Some(config) = tunnel.remote_config() else {
                continue;
            };
            let result = match self.source.current() {
                Ok(conn) => request_remote_forward(&conn, &config).await,
                Err(e) => Err(e),
            };

            match result {
                Ok((_, inbound)) => {
                    let generation = tunnel.cancel.child_token();
                    let task =
                        spawn_remote_pump(inbound, self.context(&tunnel, &generation), config);
                    let still_wanted = {
                        let mut state = tunnel.state.lock();
                        if state.status == ForwardStatus::Suspended {
                            state.status = ForwardStatus::Active;
                            state.error = None;
                            state.task = Some(task);
                            state.generation = Some(generation);
                            true
                        } else {
                            generation.cancel();
                            false
                        }
                    };
                    if still_wanted {
                        info!("Restored remote forward {}", tunnel.id);
                        self.emitter
                            .emit_forward_status(&tunnel.id, ForwardStatus::Active, None);
                        restored += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to restore remote forward {}: {}", tunnel.id, e);
                    let message = e.to_string();
                    {
                        let mut state = tunnel.state.lock();
                        state.status = ForwardStatus::Error;
                        state.error = Some(message.clone());
                    }
                    self.emitter
                        .emit_forward_status(&tunnel.id, ForwardStatus::Error, Some(message));
                }
            }
        }
        self.emit_list();
        restored
    }

    fn sorted(&self) -> Vec<Arc<Tunnel>> {
        let mut tunnels: Vec<Arc<Tunnel>> = self.tunnels.read().values().cloned().collect();
        tunnels.sort_by_key(|t| t.seq);
        tunnels
    }

    /// All tunnels in creation order
    pub fn list(&self) -> Vec<TunnelInfo> {
        self.sorted()
            .iter()
            .map(|t| t.info(&self.session_id))
            .collect()
    }

    pub fn get(&self, forward_id: &str) -> Option<TunnelInfo> {
        self.tunnels
            .read()
            .get(forward_id)
            .map(|t| t.info(&self.session_id))
    }

    pub fn stats(&self, forward_id: &str) -> Option<ForwardStats> {
        self.tunnels
            .read()
            .get(forward_id)
            .map(|t| t.stats.snapshot())
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().len()
    }

    fn emit_list(&self) {
        self.emitter.emit_forward_list(self.list());
    }
}
