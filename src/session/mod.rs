//! Session Management Module
//!
//! Provides the session registry with:
//! - Connection state machine and its legal edges
//! - Backoff policy and scheduler for silent reconnection
//! - Per-session channel multiplexing (primary and split shells, exec)
//! - Typed event emission towards the host, one sink per session

pub mod channels;
pub mod events;
pub mod reconnect;
pub mod registry;
pub mod state;

pub use channels::{ChannelError, ChannelHandle, ChannelInfo, ChannelMultiplexer, ExecOutput, ShellOutput};
pub use events::{event_channel, EngineEvent, EventEmitter, EventSink, EventStream};
pub use reconnect::{BackoffPolicy, Scheduler, TokioScheduler};
pub use registry::{
    CloseReport, RegistryError, SessionBundle, SessionExecResult, SessionInfo, SessionRegistry,
};
pub use state::ConnectionState;
