//! Configuration Management Module
//!
//! Engine settings persisted as JSON in the user's config directory, and
//! the credential vault that seals secrets inside session profiles.

pub mod settings;
pub mod vault;

pub use settings::{config_dir, settings_file, vault_file, EngineSettings, SettingsStorage, StorageError};
pub use vault::{CredentialVault, KdfParams, SealedSecret, VaultError, VaultHeader};
