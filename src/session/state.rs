//! Connection lifecycle states

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Legal lifecycle edges.
    ///
    /// `Connecting -> Disconnected` only happens when the initial connect
    /// fails. `Disconnected` is terminal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    /// A live transport exists (or is being re-established) in these states
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}
