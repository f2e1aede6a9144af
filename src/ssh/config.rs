//! SSH Configuration
//!
//! Two layers: the `*Config` types arrive from the host and may carry
//! vault-sealed secrets, while `SshConfig` / `AuthMethod` are the resolved
//! form handed to a `Connector` after the vault has opened every secret.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::vault::SealedSecret;

/// A secret field as stored in a session profile.
///
/// Plain strings are accepted for ad hoc connections; profiles loaded from
/// disk carry the sealed form.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SecretValue {
    Plain(String),
    Sealed(SealedSecret),
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::Plain(_) => f.write_str("Plain(<redacted>)"),
            SecretValue::Sealed(_) => f.write_str("Sealed(..)"),
        }
    }
}

impl SecretValue {
    pub fn is_sealed(&self) -> bool {
        matches!(self, SecretValue::Sealed(_))
    }
}

/// Authentication as configured by the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Password {
        password: SecretValue,
    },
    Key {
        key_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<SecretValue>,
    },
}

/// One SSH endpoint (target or jump host)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: AuthConfig,
}

impl EndpointConfig {
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth: AuthConfig::Password {
                password: SecretValue::Plain(password.into()),
            },
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Connection establishment, including authentication
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Default deadline for one-shot exec commands
    #[serde(default = "default_exec_secs")]
    pub exec_secs: u64,

    /// Interval between keepalive probes, 0 disables them
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Consecutive timed-out probes treated as a dropped transport
    #[serde(default = "default_keepalive_failures")]
    pub keepalive_max_failures: u32,
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            exec_secs: default_exec_secs(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max_failures: default_keepalive_failures(),
        }
    }
}

/// Everything the host supplies on a connect request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub endpoint: EndpointConfig,

    /// Optional bastion the target is reached through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<EndpointConfig>,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,

    #[serde(default)]
    pub host_key: HostKeyPolicy,

    /// Push shell output to the event sink as `shell-data` instead of
    /// leaving it for `on_data`
    #[serde(default = "default_true")]
    pub stream_output: bool,
}

impl SessionConfig {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            jump: None,
            auto_reconnect: true,
            timeouts: Timeouts::default(),
            cols: default_cols(),
            rows: default_rows(),
            host_key: HostKeyPolicy::default(),
            stream_output: true,
        }
    }

    pub fn via(mut self, jump: EndpointConfig) -> Self {
        self.jump = Some(jump);
        self
    }
}

/// Host key verification
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Trust on first use: remember the first key seen for host:port in this
    /// process and reject a different key afterwards
    #[default]
    AcceptNew,
    /// Only accept keys whose SHA-256 fingerprint is listed
    Strict { fingerprints: Vec<String> },
}

/// Authentication with every secret opened
#[derive(Clone)]
pub enum AuthMethod {
    Password {
        password: String,
    },
    Key {
        key_path: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(<redacted>)"),
            AuthMethod::Key { key_path, .. } => {
                f.debug_struct("Key").field("key_path", key_path).finish()
            }
        }
    }
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }
}

/// Resolved endpoint handed to a `Connector`
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
}

impl SshConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_secs() -> u64 {
    15
}

fn default_exec_secs() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_failures() -> u32 {
    1
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

fn default_true() -> bool {
    true
}
