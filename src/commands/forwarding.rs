//! Port forwarding commands

use serde::Deserialize;
use tracing::info;

use crate::forwarding::{ForwardStats, TunnelInfo};
use crate::session::{RegistryError, SessionRegistry};

/// Request to create a port forward
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardRequest {
    #[serde(rename_all = "camelCase")]
    Local {
        #[serde(default = "default_bind_host")]
        bind_host: String,
        bind_port: u16,
        target_host: String,
        target_port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Remote {
        #[serde(default = "default_bind_host")]
        remote_bind_host: String,
        remote_bind_port: u16,
        target_host: String,
        target_port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Dynamic {
        #[serde(default = "default_bind_host")]
        bind_host: String,
        bind_port: u16,
    },
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

pub async fn start_forward(
    registry: &SessionRegistry,
    session_id: &str,
    request: ForwardRequest,
) -> Result<TunnelInfo, RegistryError> {
    info!("Creating port forward for session {}: {:?}", session_id, request);
    match request {
        ForwardRequest::Local {
            bind_host,
            bind_port,
            target_host,
            target_port,
        } => start_local_forward(registry, session_id, &bind_host, bind_port, &target_host, target_port).await,
        ForwardRequest::Remote {
            remote_bind_host,
            remote_bind_port,
            target_host,
            target_port,
        } => {
            start_remote_forward(
                registry,
                session_id,
                remote_bind_port,
                &target_host,
                target_port,
                &remote_bind_host,
            )
            .await
        }
        ForwardRequest::Dynamic { bind_host, bind_port } => {
            start_dynamic_forward(registry, session_id, &bind_host, bind_port).await
        }
    }
}

pub async fn start_local_forward(
    registry: &SessionRegistry,
    session_id: &str,
    bind_host: &str,
    bind_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TunnelInfo, RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle
        .tunnels()
        .start_local_forward(bind_host, bind_port, target_host, target_port)
        .await?)
}

pub async fn start_remote_forward(
    registry: &SessionRegistry,
    session_id: &str,
    remote_bind_port: u16,
    target_host: &str,
    target_port: u16,
    remote_bind_host: &str,
) -> Result<TunnelInfo, RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle
        .tunnels()
        .start_remote_forward(remote_bind_port, target_host, target_port, remote_bind_host)
        .await?)
}

pub async fn start_dynamic_forward(
    registry: &SessionRegistry,
    session_id: &str,
    bind_host: &str,
    bind_port: u16,
) -> Result<TunnelInfo, RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle
        .tunnels()
        .start_dynamic_forward(bind_host, bind_port)
        .await?)
}

pub async fn stop_forward(
    registry: &SessionRegistry,
    session_id: &str,
    forward_id: &str,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    if bundle.tunnels().stop(forward_id).await {
        Ok(())
    } else {
        Err(RegistryError::ForwardNotFound(forward_id.to_string()))
    }
}

pub fn list_forwards(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<Vec<TunnelInfo>, RegistryError> {
    Ok(registry.get(session_id)?.tunnels().list())
}

pub fn get_forward_stats(
    registry: &SessionRegistry,
    session_id: &str,
    forward_id: &str,
) -> Result<ForwardStats, RegistryError> {
    registry
        .get(session_id)?
        .tunnels()
        .stats(forward_id)
        .ok_or_else(|| RegistryError::ForwardNotFound(forward_id.to_string()))
}
