//! Keyring abstraction for envelope and signing key material.
//!
//! The kernel never mints long-term keys itself; it asks a [`Keyring`] for
//! the key of a domain at a version, or for the signing seed of a purpose
//! and domain. [`InMemoryKeyring`] derives everything from one master
//! secret with BLAKE3's key-derivation mode, so every historical version
//! stays derivable after rotation.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of every key this keyring hands out.
pub const KEY_LEN: usize = 32;

const ENVELOPE_CONTEXT: &str = "seckernel 2024-01-01 envelope key v1";
const SIGNING_CONTEXT: &str = "seckernel 2024-01-01 signing seed v1";

/// Keyring error types.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// The keyring cannot supply a key for this domain.
    #[error("no key available for domain {domain}")]
    Unavailable {
        /// Domain that was requested.
        domain: String,
    },
    /// Key material has been destroyed.
    #[error("keyring destroyed")]
    Destroyed,
    /// The backing key store failed.
    #[error("keyring backend error: {0}")]
    Backend(String),
}

/// 256-bit key material that never appears in logs.
///
/// Debug output always shows `__REDACTED__`; the bytes are zeroised on
/// drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Expose the key bytes. Use only at the primitive boundary.
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Source of key material, addressed by domain.
#[async_trait]
pub trait Keyring: Send + Sync {
    /// Symmetric envelope key for `domain` at `version`.
    async fn get_key(&self, domain: &str, version: u32) -> Result<KeyMaterial, KeyringError>;

    /// Ed25519 seed for `purpose` within `domain`.
    async fn derive_signing_key(
        &self,
        purpose: &str,
        domain: &str,
    ) -> Result<KeyMaterial, KeyringError>;
}

/// Keyring deriving all keys from one in-memory master secret.
pub struct InMemoryKeyring {
    master: Arc<RwLock<Option<KeyMaterial>>>,
}

impl InMemoryKeyring {
    /// Create a keyring from a master secret.
    pub fn new(master: [u8; KEY_LEN]) -> Self {
        Self {
            master: Arc::new(RwLock::new(Some(KeyMaterial::new(master)))),
        }
    }

    /// Create a keyring with a fresh master secret from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self::new(*bytes)
    }

    /// Zeroise the master secret. Every later request fails.
    pub async fn destroy(&self) {
        let mut master = self.master.write().await;
        *master = None;
    }

    async fn derive(&self, context: &str, parts: &[&[u8]]) -> Result<KeyMaterial, KeyringError> {
        let master = self.master.read().await;
        let master = master.as_ref().ok_or(KeyringError::Destroyed)?;

        let mut input = Zeroizing::new(Vec::with_capacity(KEY_LEN.saturating_mul(2)));
        input.extend_from_slice(master.expose());
        for part in parts {
            // Length-prefix each part so boundaries are unambiguous.
            let len = u64::try_from(part.len())
                .map_err(|_| KeyringError::Backend("derivation input too large".to_owned()))?;
            input.extend_from_slice(&len.to_be_bytes());
            input.extend_from_slice(part);
        }
        Ok(KeyMaterial::new(blake3::derive_key(context, &input)))
    }
}

impl Default for InMemoryKeyring {
    fn default() -> Self {
        Self::generate()
    }
}

#[async_trait]
impl Keyring for InMemoryKeyring {
    async fn get_key(&self, domain: &str, version: u32) -> Result<KeyMaterial, KeyringError> {
        if domain.is_empty() {
            return Err(KeyringError::Unavailable {
                domain: domain.to_owned(),
            });
        }
        self.derive(ENVELOPE_CONTEXT, &[domain.as_bytes(), &version.to_be_bytes()])
            .await
    }

    async fn derive_signing_key(
        &self,
        purpose: &str,
        domain: &str,
    ) -> Result<KeyMaterial, KeyringError> {
        if domain.is_empty() {
            return Err(KeyringError::Unavailable {
                domain: domain.to_owned(),
            });
        }
        self.derive(SIGNING_CONTEXT, &[purpose.as_bytes(), domain.as_bytes()])
            .await
    }
}
