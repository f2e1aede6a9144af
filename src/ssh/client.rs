//! SSH client built on russh
//!
//! `RusshConnector` performs TCP connect, handshake, host key check and
//! authentication, then moves the handle into its owner task and wraps the
//! controller as an `SshConnection`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::Channel;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, HostKeyPolicy, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::proxy;
use super::session::{start_exec, start_shell};
use super::transport::{
    BoxedStream, ChannelIo, Connector, InboundForward, PingResult, PtyRequest, SshConnection,
};
use crate::sftp::fs::{FileSystem, SftpFs};

const FORWARD_QUEUE: usize = 64;

/// Shared russh client configuration. Liveness is driven by the
/// supervisor's keepalive probes, not by russh's inactivity timer.
pub(super) fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// `SHA256:<base64>` fingerprint, as printed by OpenSSH
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(hasher.finalize()).trim_end_matches('='))
}

/// Host keys accepted during this process, keyed by `host:port`
#[derive(Clone, Default)]
pub struct KnownHosts {
    entries: Arc<DashMap<String, String>>,
}

impl KnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, port: u16) -> Option<String> {
        self.entries
            .get(&format!("{}:{}", host, port))
            .map(|e| e.value().clone())
    }

    fn verify(&self, host: &str, port: u16, policy: &HostKeyPolicy, actual: &str) -> Result<(), SshError> {
        match policy {
            HostKeyPolicy::Strict { fingerprints } => {
                if fingerprints.iter().any(|f| f == actual) {
                    Ok(())
                } else {
                    Err(SshError::AuthenticationFailed(format!(
                        "Host key verification failed for {}:{} (fingerprint {})",
                        host, port, actual
                    )))
                }
            }
            HostKeyPolicy::AcceptNew => {
                let key = format!("{}:{}", host, port);
                let stored = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| actual.to_string())
                    .value()
                    .clone();
                if stored == actual {
                    Ok(())
                } else {
                    warn!(
                        "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                        host, port, stored, actual
                    );
                    Err(SshError::AuthenticationFailed(format!(
                        "Host key for {}:{} changed (expected {}, got {})",
                        host, port, stored, actual
                    )))
                }
            }
        }
    }
}

/// Routes server-initiated forwarded-tcpip channels to the remote forward
/// that requested them
#[derive(Default)]
pub struct ForwardRouter {
    routes: DashMap<(String, u32), mpsc::Sender<InboundForward>>,
}

impl ForwardRouter {
    fn register(&self, address: &str, port: u32) -> mpsc::Receiver<InboundForward> {
        let (tx, rx) = mpsc::channel(FORWARD_QUEUE);
        self.routes.insert((address.to_string(), port), tx);
        rx
    }

    fn unregister(&self, address: &str, port: u32) {
        self.routes.remove(&(address.to_string(), port));
    }

    fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<InboundForward>> {
        if let Some(tx) = self.routes.get(&(address.to_string(), port)) {
            return Some(tx.value().clone());
        }
        // Servers may echo a normalised bind address; fall back to the port
        self.routes
            .iter()
            .find(|entry| entry.key().1 == port)
            .map(|entry| entry.value().clone())
    }
}

/// russh callbacks for one connection
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: KnownHosts,
    forwards: Arc<ForwardRouter>,
}

impl ClientHandler {
    pub fn new(config: &SshConfig, known_hosts: KnownHosts, forwards: Arc<ForwardRouter>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            policy: config.host_key.clone(),
            known_hosts,
            forwards,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        self.known_hosts
            .verify(&self.host, self.port, &self.policy, &actual)?;
        debug!("Host key accepted for {}:{} ({})", self.host, self.port, actual);
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded-tcpip {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(tx) = self.forwards.lookup(connected_address, connected_port) else {
            warn!(
                "No remote forward registered for {}:{}, dropping channel",
                connected_address, connected_port
            );
            return Ok(());
        };

        let inbound = InboundForward {
            stream: Box::new(channel.into_stream()),
            originator_host: originator_address.to_string(),
            originator_port,
        };
        // Never block the session event loop on a slow forward
        tokio::spawn(async move {
            let _ = tx.send(inbound).await;
        });
        Ok(())
    }
}

/// Run the configured authentication method on a fresh handle
pub(super) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SshConfig,
) -> Result<(), SshError> {
    let result = match &config.auth {
        AuthMethod::Password { password } => {
            handle
                .authenticate_password(&config.username, password)
                .await?
        }
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(expand_tilde(key_path), passphrase.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&config.username, key_with_hash)
                .await?
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "{}@{} rejected the credentials",
            config.username,
            config.address()
        )));
    }
    info!("Authenticated to {}", config.address());
    Ok(())
}

/// Expand a leading `~` so russh can open the key file
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Live russh connection behind its owner task
pub struct RusshConnection {
    controller: HandleController,
    forwards: Arc<ForwardRouter>,
    label: String,
    channel_buffer: usize,
}

impl RusshConnection {
    pub(super) fn spawn(
        handle: Handle<ClientHandler>,
        forwards: Arc<ForwardRouter>,
        label: String,
        channel_buffer: usize,
    ) -> Self {
        let controller = spawn_handle_owner_task(handle, label.clone());
        Self {
            controller,
            forwards,
            label,
            channel_buffer,
        }
    }
}

#[async_trait]
impl SshConnection for RusshConnection {
    async fn open_shell(&self, pty: PtyRequest) -> Result<ChannelIo, SshError> {
        let channel = self.controller.open_session_channel().await?;
        let label = format!("{} shell", self.label);
        start_shell(channel, &pty, label, self.channel_buffer).await
    }

    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError> {
        let channel = self
            .controller
            .open_session_channel()
            .await
            .map_err(|e| SshError::Exec(e.to_string()))?;
        let label = format!("{} exec", self.label);
        start_exec(channel, command, label, self.channel_buffer).await
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<BoxedStream, SshError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, originator_host, originator_port as u32)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_forward(
        &self,
        address: &str,
        port: u16,
    ) -> Result<(u16, mpsc::Receiver<InboundForward>), SshError> {
        let bound = self.controller.tcpip_forward(address, port as u32).await?;
        let rx = self.forwards.register(address, bound);
        info!("Remote forward {}:{} bound on {}", address, bound, self.label);
        Ok((bound as u16, rx))
    }

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.forwards.unregister(address, port as u32);
        self.controller
            .cancel_tcpip_forward(address, port as u32)
            .await
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelOpen(format!("SFTP subsystem refused: {}", e)))?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ProtocolError(format!("SFTP init failed: {}", e)))?;
        debug!("SFTP session opened on {}", self.label);
        Ok(Arc::new(SftpFs::new(sftp)))
    }

    async fn ping(&self) -> PingResult {
        self.controller.ping().await
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }
}

/// Production `Connector`
#[derive(Clone)]
pub struct RusshConnector {
    known_hosts: KnownHosts,
    channel_buffer: usize,
}

impl RusshConnector {
    pub fn new(channel_buffer: usize) -> Self {
        Self {
            known_hosts: KnownHosts::new(),
            channel_buffer,
        }
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        config: &SshConfig,
        via: Option<Arc<dyn SshConnection>>,
    ) -> Result<Arc<dyn SshConnection>, SshError> {
        let forwards = Arc::new(ForwardRouter::default());
        let handler = ClientHandler::new(config, self.known_hosts.clone(), forwards.clone());

        let mut handle = match via {
            Some(jump) => proxy::connect_via(jump.as_ref(), config, handler).await?,
            None => {
                info!("Connecting to SSH server at {}", config.address());
                client::connect(client_config(), (config.host.as_str(), config.port), handler)
                    .await?
            }
        };
        debug!("SSH handshake completed with {}", config.address());

        authenticate(&mut handle, config).await?;

        let label = format!("{}@{}", config.username, config.address());
        Ok(Arc::new(RusshConnection::spawn(
            handle,
            forwards,
            label,
            self.channel_buffer,
        )))
    }
}
