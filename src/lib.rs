//! sshmux - session transport and tunneling engine for a desktop SSH client
//!
//! Built on tokio and russh. The UI host owns one [`SessionRegistry`] and
//! talks to it through [`commands`]; everything the engine reports back
//! arrives as [`EngineEvent`]s on the sink passed to `connect`.

pub mod commands;
pub mod config;
pub mod forwarding;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod test_utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{CredentialVault, EngineSettings, SettingsStorage};
pub use session::{event_channel, EngineEvent, EventSink, RegistryError, SessionRegistry};
pub use ssh::{ErrorKind, SessionConfig, SshError};

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
