//! Engine Event System
//!
//! Every observable change crosses the UI boundary as an `EngineEvent`.
//! Each session owns one `EventEmitter` that forwards into the sink the
//! host supplied when it connected that session.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::forwarding::manager::{ForwardStatus, TunnelInfo};
use crate::session::state::ConnectionState;
use crate::sftp::types::TransferRecord;

/// Receiving end is owned by the host
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;
pub type EventStream = mpsc::UnboundedReceiver<EngineEvent>;

pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    StateChanged {
        session_id: String,
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ReconnectProgress {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    ShellOpened {
        session_id: String,
        channel_id: u32,
        primary: bool,
    },
    ShellData {
        session_id: String,
        channel_id: u32,
        bytes: Vec<u8>,
    },
    ShellClosed {
        session_id: String,
        channel_id: u32,
    },
    ForwardListChanged {
        session_id: String,
        forwards: Vec<TunnelInfo>,
    },
    ForwardStatusChanged {
        session_id: String,
        forward_id: String,
        status: ForwardStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TransferProgress {
        session_id: String,
        transfer_id: String,
        progress_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
    },
    TransferQueueChanged {
        session_id: String,
        queue: Vec<TransferRecord>,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::StateChanged { session_id, .. }
            | EngineEvent::ReconnectProgress { session_id, .. }
            | EngineEvent::ShellOpened { session_id, .. }
            | EngineEvent::ShellData { session_id, .. }
            | EngineEvent::ShellClosed { session_id, .. }
            | EngineEvent::ForwardListChanged { session_id, .. }
            | EngineEvent::ForwardStatusChanged { session_id, .. }
            | EngineEvent::TransferProgress { session_id, .. }
            | EngineEvent::TransferQueueChanged { session_id, .. } => session_id,
        }
    }
}

/// Per-session event emitter
///
/// Emission never blocks; a closed sink just drops events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<EventSink>,
    session_id: String,
}

impl EventEmitter {
    pub fn new(tx: EventSink, session_id: impl Into<String>) -> Self {
        Self {
            tx: Some(tx),
            session_id: session_id.into(),
        }
    }

    /// Emitter that discards everything
    pub fn noop(session_id: impl Into<String>) -> Self {
        Self {
            tx: None,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("Event sink closed for session {}", self.session_id);
            }
        }
    }

    pub fn emit_state(&self, state: ConnectionState, reason: Option<String>) {
        self.emit(EngineEvent::StateChanged {
            session_id: self.session_id.clone(),
            state,
            reason,
        });
    }

    pub fn emit_reconnect_progress(&self, attempt: u32, max_attempts: u32, delay_ms: u64) {
        self.emit(EngineEvent::ReconnectProgress {
            session_id: self.session_id.clone(),
            attempt,
            max_attempts,
            delay_ms,
        });
    }

    pub fn emit_shell_opened(&self, channel_id: u32, primary: bool) {
        self.emit(EngineEvent::ShellOpened {
            session_id: self.session_id.clone(),
            channel_id,
            primary,
        });
    }

    pub fn emit_shell_data(&self, channel_id: u32, bytes: Vec<u8>) {
        self.emit(EngineEvent::ShellData {
            session_id: self.session_id.clone(),
            channel_id,
            bytes,
        });
    }

    pub fn emit_shell_closed(&self, channel_id: u32) {
        self.emit(EngineEvent::ShellClosed {
            session_id: self.session_id.clone(),
            channel_id,
        });
    }

    pub fn emit_forward_list(&self, forwards: Vec<TunnelInfo>) {
        self.emit(EngineEvent::ForwardListChanged {
            session_id: self.session_id.clone(),
            forwards,
        });
    }

    pub fn emit_forward_status(&self, forward_id: &str, status: ForwardStatus, error: Option<String>) {
        self.emit(EngineEvent::ForwardStatusChanged {
            session_id: self.session_id.clone(),
            forward_id: forward_id.to_string(),
            status,
            error,
        });
    }

    pub fn emit_transfer_progress(
        &self,
        transfer_id: &str,
        progress_bytes: u64,
        total_bytes: u64,
        speed_bps: u64,
    ) {
        self.emit(EngineEvent::TransferProgress {
            session_id: self.session_id.clone(),
            transfer_id: transfer_id.to_string(),
            progress_bytes,
            total_bytes,
            speed_bps,
        });
    }

    pub fn emit_transfer_queue(&self, queue: Vec<TransferRecord>) {
        self.emit(EngineEvent::TransferQueueChanged {
            session_id: self.session_id.clone(),
            queue,
        });
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("session_id", &self.session_id)
            .field("has_sink", &self.tx.is_some())
            .finish()
    }
}
