//! Destination conflict handling
//!
//! Every enqueue call carries one `ConflictPolicy` for its whole batch.
//! `Ask` defers to the host through a `ConflictResolver`; prompts within a
//! batch are serialized, and an "apply to all" answer replaces the batch
//! policy for every item still to come.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::error::TransferError;
use super::fs::FileSystem;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    Overwrite,
    Skip,
    Rename,
    SkipIfSameSize,
    Ask,
}

/// A concrete answer to one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictAction {
    Overwrite,
    Skip,
    Rename,
    SkipIfSameSize,
}

impl From<ConflictAction> for ConflictPolicy {
    fn from(action: ConflictAction) -> Self {
        match action {
            ConflictAction::Overwrite => ConflictPolicy::Overwrite,
            ConflictAction::Skip => ConflictPolicy::Skip,
            ConflictAction::Rename => ConflictPolicy::Rename,
            ConflictAction::SkipIfSameSize => ConflictPolicy::SkipIfSameSize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDecision {
    pub action: ConflictAction,
    pub apply_to_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub transfer_id: String,
    pub batch_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub source_size: u64,
    pub dest_size: u64,
}

/// Host callback deciding what to do with an existing destination
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &ConflictInfo) -> ConflictDecision;
}

/// Where a transfer should write, if anywhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Write(String),
    Skip,
}

/// Conflict state shared by all transfers of one batch
pub struct BatchPolicy {
    id: String,
    policy: Mutex<ConflictPolicy>,
}

impl BatchPolicy {
    pub fn new(id: impl Into<String>, policy: ConflictPolicy) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            policy: Mutex::new(policy),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn current(&self) -> ConflictPolicy {
        *self.policy.lock().await
    }

    /// Decide what to do with `conflict.dest_path`, which already exists
    pub async fn resolve(
        &self,
        conflict: ConflictInfo,
        dest_is_dir: bool,
        dest_fs: &dyn FileSystem,
        resolver: Option<&Arc<dyn ConflictResolver>>,
    ) -> Result<Resolution, TransferError> {
        // Held across the prompt so one batch asks one question at a time
        let mut policy = self.policy.lock().await;

        let action = match *policy {
            ConflictPolicy::Ask => match resolver {
                Some(resolver) => {
                    let decision = resolver.resolve(&conflict).await;
                    if decision.apply_to_all {
                        *policy = decision.action.into();
                        debug!("Batch {} now resolves conflicts with {:?}", self.id, *policy);
                    }
                    decision.action
                }
                None => ConflictAction::Skip,
            },
            ConflictPolicy::Overwrite => ConflictAction::Overwrite,
            ConflictPolicy::Skip => ConflictAction::Skip,
            ConflictPolicy::Rename => ConflictAction::Rename,
            ConflictPolicy::SkipIfSameSize => ConflictAction::SkipIfSameSize,
        };
        drop(policy);

        let dest = conflict.dest_path.as_str();
        if dest_is_dir && action != ConflictAction::Rename {
            return match action {
                ConflictAction::Skip | ConflictAction::SkipIfSameSize => Ok(Resolution::Skip),
                _ => Err(TransferError::InvalidState(format!(
                    "{} is a directory",
                    dest
                ))),
            };
        }

        match action {
            ConflictAction::Overwrite => Ok(Resolution::Write(dest.to_string())),
            ConflictAction::Skip => Ok(Resolution::Skip),
            ConflictAction::SkipIfSameSize if conflict.dest_size == conflict.source_size => Ok(Resolution::Skip),
            ConflictAction::SkipIfSameSize => Ok(Resolution::Write(dest.to_string())),
            ConflictAction::Rename => Ok(Resolution::Write(unique_name(dest_fs, dest).await?)),
        }
    }
}

/// `dir/name (n).ext` for the n-th alternative to `path`
pub fn numbered(path: &str, n: u32) -> String {
    let split = path.rfind(['/', '\\']).map(|i| i + 1).unwrap_or(0);
    let (dir, name) = path.split_at(split);

    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    format!("{}{} ({}){}", dir, stem, n, ext)
}

/// First `numbered` variant of `path` that does not exist yet
pub async fn unique_name(fs: &dyn FileSystem, path: &str) -> Result<String, TransferError> {
    for n in 1..10_000 {
        let candidate = numbered(path, n);
        if fs.stat(&candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(TransferError::InvalidState(format!(
        "no free name next to {}",
        path
    )))
}
