//! Session and shell commands

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::session::{
    ChannelHandle, ChannelInfo, CloseReport, ConnectionState, EventSink, ExecOutput,
    RegistryError, SessionExecResult, SessionInfo, SessionRegistry,
};
use crate::ssh::SessionConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    pub state: ConnectionState,
    /// Absent when the server refused the primary shell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_channel: Option<u32>,
}

/// Connect a new session; its events go to `sink`
pub async fn connect(
    registry: &SessionRegistry,
    config: SessionConfig,
    sink: EventSink,
) -> Result<ConnectResponse, RegistryError> {
    let bundle = registry.connect(config, sink).await?;
    let primary_channel = bundle
        .channels()
        .list()
        .into_iter()
        .find(|c| c.primary)
        .map(|c| c.channel_id);
    info!("Session {} ready", bundle.id());
    Ok(ConnectResponse {
        session_id: bundle.id().to_string(),
        state: bundle.state(),
        primary_channel,
    })
}

pub async fn disconnect(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<CloseReport, RegistryError> {
    registry.disconnect(session_id).await
}

pub fn list_sessions(registry: &SessionRegistry) -> Vec<SessionInfo> {
    registry.list()
}

pub fn get_session(registry: &SessionRegistry, session_id: &str) -> Result<SessionInfo, RegistryError> {
    Ok(registry.get(session_id)?.info())
}

pub async fn open_split_shell(
    registry: &SessionRegistry,
    session_id: &str,
    cols: u32,
    rows: u32,
) -> Result<ChannelHandle, RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.open_shell(cols, rows).await?)
}

pub async fn shell_write(
    registry: &SessionRegistry,
    session_id: &str,
    channel_id: u32,
    data: Vec<u8>,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.channels().write(channel_id, data).await?)
}

pub async fn shell_resize(
    registry: &SessionRegistry,
    session_id: &str,
    channel_id: u32,
    cols: u32,
    rows: u32,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.channels().resize(channel_id, cols, rows).await?)
}

pub fn close_shell(
    registry: &SessionRegistry,
    session_id: &str,
    channel_id: u32,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.channels().close(channel_id)?)
}

pub fn list_channels(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<Vec<ChannelInfo>, RegistryError> {
    Ok(registry.get(session_id)?.channels().list())
}

/// One-shot command; `timeout_secs` falls back to the session's exec timeout
pub async fn exec_command(
    registry: &SessionRegistry,
    session_id: &str,
    command: &str,
    timeout_secs: Option<u64>,
) -> Result<ExecOutput, RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle
        .exec(command, timeout_secs.map(Duration::from_secs))
        .await?)
}

pub async fn run_on_all(
    registry: &SessionRegistry,
    command: &str,
    timeout_secs: Option<u64>,
) -> Vec<SessionExecResult> {
    registry
        .run_on_all(command, timeout_secs.map(Duration::from_secs))
        .await
}
