//! Transfer data types

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer status.
///
/// Moves forward only, except `Active <-> Paused`. `Completed`, `Error`,
/// `Cancelled` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Error,
    Cancelled,
    Skipped,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Error
                | TransferStatus::Cancelled
                | TransferStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Error)
                | (Queued, Cancelled)
                | (Queued, Skipped)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Error)
                | (Active, Cancelled)
                | (Active, Skipped)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Skipped)
                | (Paused, Error)
                | (Paused, Cancelled)
        )
    }
}

/// What happens to partially written output on cancel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Leave it for the caller to inspect or delete
    #[default]
    LeavePartial,
    RemovePartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSettings {
    /// Transfers running at once per session
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Minimum gap between two progress events of one transfer
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Deadline for a single read or write
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    #[serde(default)]
    pub cancel_policy: CancelPolicy,
}

impl TransferSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval(),
            io_timeout_secs: default_io_timeout(),
            cancel_policy: CancelPolicy::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_progress_interval() -> u64 {
    200
}

fn default_io_timeout() -> u64 {
    300
}

/// Snapshot of one queued transfer as shown to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub session_id: String,
    /// Directory transfers share a batch id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub direction: TransferDirection,
    pub source_path: String,
    pub dest_path: String,
    pub status: TransferStatus,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
