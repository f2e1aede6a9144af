//! Credential Vault
//!
//! Opens the sealed secret fields of stored session profiles.
//!
//! - Argon2id derives a 32-byte master key from the user's passphrase
//! - A second, independently salted Argon2id hash verifies the passphrase
//!   so a wrong passphrase is reported as such instead of as a decryption
//!   failure on the first record
//! - Each secret is sealed with ChaCha20-Poly1305 under a per-record key
//!   (SHA-256 of master key and a random record salt) and a random nonce
//!
//! The master key lives only in memory and is wiped on `lock()`.

use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::ssh::error::ErrorKind;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const VAULT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Decryption failed (wrong key or tampered data)")]
    DecryptionFailed,

    #[error("Vault is locked")]
    Locked,

    #[error("Invalid sealed record: {0}")]
    InvalidRecord(String),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Unsupported vault version: {0}")]
    UnsupportedVersion(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::WrongPassphrase => ErrorKind::WrongPassphrase,
            VaultError::DecryptionFailed => ErrorKind::DecryptionFailed,
            VaultError::Locked => ErrorKind::Locked,
            VaultError::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Vault,
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, 4 lanes
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

fn derive_key(
    passphrase: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|_| VaultError::KeyDerivation)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|_| VaultError::KeyDerivation)?;
    Ok(key)
}

fn record_key(master: &[u8; KEY_LEN], salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(b"sshmux-record-key");
    hasher.update(master);
    hasher.update(salt);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&hasher.finalize());
    key
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(value)
        .map_err(|e| VaultError::InvalidRecord(format!("{}: {}", name, e)))
}

/// One sealed secret field as persisted in a session profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub auth_tag: String,
}

/// Persisted vault header. Holds no key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultHeader {
    pub version: u32,
    pub kdf: KdfParams,
    /// Salt for the master key derivation
    pub key_salt: String,
    /// Salt for the passphrase verification hash
    pub verify_salt: String,
    pub verify_hash: String,
}

pub struct CredentialVault {
    header: VaultHeader,
    key: RwLock<Option<Zeroizing<[u8; KEY_LEN]>>>,
}

impl CredentialVault {
    /// Initialise a new vault protected by `passphrase`. The vault starts unlocked.
    pub fn create(passphrase: &str, kdf: KdfParams) -> Result<Self, VaultError> {
        let key_salt = random_bytes::<SALT_LEN>();
        let verify_salt = random_bytes::<SALT_LEN>();
        let verify_hash = derive_key(passphrase, &verify_salt, &kdf)?;
        let master = derive_key(passphrase, &key_salt, &kdf)?;

        let header = VaultHeader {
            version: VAULT_VERSION,
            kdf,
            key_salt: BASE64.encode(key_salt),
            verify_salt: BASE64.encode(verify_salt),
            verify_hash: BASE64.encode(*verify_hash),
        };

        info!("Created credential vault");
        Ok(Self {
            header,
            key: RwLock::new(Some(master)),
        })
    }

    /// Open an existing vault header. The vault starts locked.
    pub fn from_header(header: VaultHeader) -> Result<Self, VaultError> {
        if header.version != VAULT_VERSION {
            return Err(VaultError::UnsupportedVersion(header.version));
        }
        Ok(Self {
            header,
            key: RwLock::new(None),
        })
    }

    pub async fn load(path: &Path) -> Result<Self, VaultError> {
        let content = tokio::fs::read_to_string(path).await?;
        let header: VaultHeader = serde_json::from_str(&content)?;
        Self::from_header(header)
    }

    pub async fn save(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&self.header)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn header(&self) -> &VaultHeader {
        &self.header
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().is_some()
    }

    /// Verify `passphrase` and derive its master key
    fn derive_master(&self, passphrase: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
        let verify_salt = decode_field("verifySalt", &self.header.verify_salt)?;
        let expected = decode_field("verifyHash", &self.header.verify_hash)?;
        let actual = derive_key(passphrase, &verify_salt, &self.header.kdf)?;

        if !bool::from(actual.as_slice().ct_eq(expected.as_slice())) {
            return Err(VaultError::WrongPassphrase);
        }

        let key_salt = decode_field("keySalt", &self.header.key_salt)?;
        derive_key(passphrase, &key_salt, &self.header.kdf)
    }

    /// Verify the passphrase and cache the derived master key.
    ///
    /// A failed attempt leaves the current lock state untouched.
    pub fn unlock(&self, passphrase: &str) -> Result<(), VaultError> {
        match self.derive_master(passphrase) {
            Ok(master) => {
                *self.key.write() = Some(master);
                info!("Credential vault unlocked");
                Ok(())
            }
            Err(e) => {
                warn!("Vault unlock failed: {}", e);
                Err(e)
            }
        }
    }

    /// Wipe the cached key. Callers must `unlock` again before opening secrets.
    pub fn lock(&self) {
        // Dropping the Zeroizing wrapper clears the key bytes
        if self.key.write().take().is_some() {
            info!("Credential vault locked");
        }
    }

    pub fn encrypt_secret(&self, plaintext: &str) -> Result<SealedSecret, VaultError> {
        let guard = self.key.read();
        let master = guard.as_ref().ok_or(VaultError::Locked)?;
        seal(master, plaintext)
    }

    /// Open a record with the cached key
    pub fn open(&self, record: &SealedSecret) -> Result<Zeroizing<String>, VaultError> {
        let guard = self.key.read();
        let master = guard.as_ref().ok_or(VaultError::Locked)?;
        unseal(master, record)
    }

    /// Open a record with an explicit passphrase, independent of lock state
    pub fn decrypt_secret(
        &self,
        record: &SealedSecret,
        passphrase: &str,
    ) -> Result<Zeroizing<String>, VaultError> {
        let master = self.derive_master(passphrase)?;
        unseal(&master, record)
    }
}

fn seal(master: &[u8; KEY_LEN], plaintext: &str) -> Result<SealedSecret, VaultError> {
    let salt = random_bytes::<SALT_LEN>();
    let nonce = random_bytes::<NONCE_LEN>();
    let key = record_key(master, &salt);

    let cipher = ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| VaultError::KeyDerivation)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| VaultError::KeyDerivation)?;

    // ChaCha20Poly1305 appends the 16-byte tag
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(SealedSecret {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(nonce),
        salt: BASE64.encode(salt),
        auth_tag: BASE64.encode(tag),
    })
}

fn unseal(master: &[u8; KEY_LEN], record: &SealedSecret) -> Result<Zeroizing<String>, VaultError> {
    let salt = decode_field("salt", &record.salt)?;
    let nonce = decode_field("iv", &record.iv)?;
    let tag = decode_field("authTag", &record.auth_tag)?;
    let mut payload = decode_field("ciphertext", &record.ciphertext)?;

    if nonce.len() != NONCE_LEN {
        return Err(VaultError::InvalidRecord(format!(
            "iv must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(VaultError::InvalidRecord(format!(
            "authTag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        )));
    }
    payload.extend_from_slice(&tag);

    let key = record_key(master, &salt);
    let cipher = ChaCha20Poly1305::new_from_slice(&*key).map_err(|_| VaultError::KeyDerivation)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), payload.as_ref())
            .map_err(|_| VaultError::DecryptionFailed)?,
    );

    let text = std::str::from_utf8(&plaintext).map_err(|_| VaultError::DecryptionFailed)?;
    debug!("Opened sealed secret ({} bytes)", text.len());
    Ok(Zeroizing::new(text.to_string()))
}

#[cfg(test)]
pub(crate) fn cheap_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}
