//! Vault and settings commands

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{
    CredentialVault, EngineSettings, KdfParams, SealedSecret, SettingsStorage, StorageError,
    VaultError,
};
use crate::session::{RegistryError, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub configured: bool,
    pub unlocked: bool,
}

/// Create a vault at `path` and install it, unlocked, on the registry
pub async fn vault_create(
    registry: &SessionRegistry,
    path: &Path,
    passphrase: &str,
    kdf: KdfParams,
) -> Result<VaultStatus, RegistryError> {
    let vault = CredentialVault::create(passphrase, kdf)?;
    vault.save(path).await?;
    info!("Vault header written to {:?}", path);
    registry.set_vault(Some(Arc::new(vault)));
    Ok(vault_status(registry))
}

/// Install the vault stored at `path`. It stays locked until `vault_unlock`.
pub async fn vault_load(registry: &SessionRegistry, path: &Path) -> Result<VaultStatus, RegistryError> {
    let vault = CredentialVault::load(path).await?;
    registry.set_vault(Some(Arc::new(vault)));
    Ok(vault_status(registry))
}

pub fn vault_unlock(registry: &SessionRegistry, passphrase: &str) -> Result<(), RegistryError> {
    let vault = registry.vault().ok_or(VaultError::Locked)?;
    Ok(vault.unlock(passphrase)?)
}

pub fn vault_lock(registry: &SessionRegistry) {
    if let Some(vault) = registry.vault() {
        vault.lock();
    }
}

pub fn vault_status(registry: &SessionRegistry) -> VaultStatus {
    match registry.vault() {
        Some(vault) => VaultStatus {
            configured: true,
            unlocked: vault.is_unlocked(),
        },
        None => VaultStatus {
            configured: false,
            unlocked: false,
        },
    }
}

/// Seal a secret for storage in a session profile
pub fn vault_encrypt(registry: &SessionRegistry, plaintext: &str) -> Result<SealedSecret, RegistryError> {
    let vault = registry.vault().ok_or(VaultError::Locked)?;
    Ok(vault.encrypt_secret(plaintext)?)
}

pub async fn load_settings(storage: &SettingsStorage) -> Result<EngineSettings, StorageError> {
    storage.load().await
}

pub async fn save_settings(
    storage: &SettingsStorage,
    settings: &EngineSettings,
) -> Result<(), StorageError> {
    storage.save(settings).await
}
