//! Transfer queue commands

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::session::{RegistryError, SessionRegistry};
use crate::sftp::{ConflictPolicy, ConflictResolver, EnqueueOutcome, TransferDirection, TransferRecord};

/// Request to queue a file or directory transfer
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub source_path: String,
    pub dest_path: String,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

pub async fn enqueue_transfer(
    registry: &SessionRegistry,
    session_id: &str,
    request: TransferRequest,
) -> Result<EnqueueOutcome, RegistryError> {
    let bundle = registry.get(session_id)?;
    let outcome = bundle
        .transfers()
        .enqueue(
            request.direction,
            &request.source_path,
            &request.dest_path,
            request.conflict_policy,
        )
        .await?;
    info!(
        "Queued {} transfer(s) for session {}: {} -> {}",
        outcome.transfer_ids.len(),
        session_id,
        request.source_path,
        request.dest_path
    );
    Ok(outcome)
}

pub async fn enqueue_upload(
    registry: &SessionRegistry,
    session_id: &str,
    local_path: &str,
    remote_path: &str,
    policy: ConflictPolicy,
) -> Result<EnqueueOutcome, RegistryError> {
    enqueue_transfer(
        registry,
        session_id,
        TransferRequest {
            direction: TransferDirection::Upload,
            source_path: local_path.to_string(),
            dest_path: remote_path.to_string(),
            conflict_policy: policy,
        },
    )
    .await
}

pub async fn enqueue_download(
    registry: &SessionRegistry,
    session_id: &str,
    remote_path: &str,
    local_path: &str,
    policy: ConflictPolicy,
) -> Result<EnqueueOutcome, RegistryError> {
    enqueue_transfer(
        registry,
        session_id,
        TransferRequest {
            direction: TransferDirection::Download,
            source_path: remote_path.to_string(),
            dest_path: local_path.to_string(),
            conflict_policy: policy,
        },
    )
    .await
}

pub async fn pause_transfer(
    registry: &SessionRegistry,
    session_id: &str,
    transfer_id: &str,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.transfers().pause(transfer_id).await?)
}

pub async fn resume_transfer(
    registry: &SessionRegistry,
    session_id: &str,
    transfer_id: &str,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.transfers().resume(transfer_id).await?)
}

pub async fn cancel_transfer(
    registry: &SessionRegistry,
    session_id: &str,
    transfer_id: &str,
) -> Result<(), RegistryError> {
    let bundle = registry.get(session_id)?;
    Ok(bundle.transfers().cancel(transfer_id).await?)
}

pub async fn list_transfers(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<Vec<TransferRecord>, RegistryError> {
    Ok(registry.get(session_id)?.transfers().snapshot().await)
}

pub async fn clear_finished_transfers(
    registry: &SessionRegistry,
    session_id: &str,
) -> Result<usize, RegistryError> {
    Ok(registry.get(session_id)?.transfers().clear_finished().await)
}

/// Install the prompt used by batches queued with `ConflictPolicy::Ask`
pub fn set_conflict_resolver(
    registry: &SessionRegistry,
    session_id: &str,
    resolver: Option<Arc<dyn ConflictResolver>>,
) -> Result<(), RegistryError> {
    registry.get(session_id)?.transfers().set_conflict_resolver(resolver);
    Ok(())
}
