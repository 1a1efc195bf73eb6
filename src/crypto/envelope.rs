//! Classification-keyed envelope encryption.
//!
//! Every payload is sealed with ChaCha20-Poly1305 under the key of its
//! label's domain at the active key version. The nonce is drawn from the
//! OS CSPRNG inside [`EnvelopeCipher::encrypt`]; callers cannot supply one.
//! The domain and key version are bound in as associated data.
//!
//! Decryption failures of any kind surface as
//! [`CryptoError::DecryptionFailed`]; the actual cause goes only to the
//! debug log and the audit sink.

use std::fmt;
use std::sync::{Arc, Mutex};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::domain::DomainCache;
use super::keyring::{KeyMaterial, Keyring};
use crate::audit::event::{AuditEvent, AuditEventType};
use crate::audit::sink::AuditSink;
use crate::cache::LruCache;
use crate::label::{Entity, Lattice, SecurityLabel};
use crate::signing::rotation::KeyLifecycle;

/// Algorithm identifier recorded in every envelope.
pub const ALGORITHM_ID: &str = "AEAD-256";

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Length of an access hint in hex characters.
pub const ACCESS_HINT_LEN: usize = 16;

/// Crypto error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The payload could not be sealed.
    #[error("encryption failed")]
    EncryptionFailed,
    /// The envelope could not be opened. Intentionally carries no cause.
    #[error("decryption failed")]
    DecryptionFailed,
    /// The keyring could not supply a key for the domain.
    #[error("no key available for domain {domain}")]
    KeyUnavailable {
        /// Domain that was requested.
        domain: String,
    },
}

/// A sealed payload with everything needed to open it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Ciphertext including the authentication tag.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Per-call random nonce.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Key version the payload was sealed under.
    pub key_version: u32,
    /// Always [`ALGORITHM_ID`].
    pub algorithm_id: String,
    /// Domain the payload was sealed under.
    pub domain: String,
}

/// A whole record sealed under its own label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEntity {
    /// Effective label the record was sealed under.
    pub label: SecurityLabel,
    /// Whether only the polyinstantiated instance payload was sealed.
    pub polyinstantiated: bool,
    /// The sealed payload.
    pub envelope: EncryptedEnvelope,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn associated_data(domain: &str, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(domain.len().saturating_add(16));
    aad.extend_from_slice(b"seckernel-envelope\0");
    aad.extend_from_slice(domain.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// One-way daily hint over a label for coarse filtering.
///
/// SHA-256 over the level rank, sorted compartments and UTC day, truncated
/// to [`ACCESS_HINT_LEN`] hex characters. Returns `None` for levels outside
/// the lattice. Not a security boundary.
pub fn access_hint(lattice: &Lattice, label: &SecurityLabel, at: DateTime<Utc>) -> Option<String> {
    let rank = lattice.rank(&label.classification)?;
    let compartments: Vec<&str> = label.compartments.iter().map(String::as_str).collect();
    let material = format!(
        "{rank}|{}|{}",
        compartments.join(","),
        at.format("%Y-%m-%d")
    );
    let digest = Sha256::digest(material.as_bytes());
    let mut hint = hex::encode(digest);
    hint.truncate(ACCESS_HINT_LEN);
    Some(hint)
}

/// Encrypts and decrypts payloads under per-domain, versioned keys.
pub struct EnvelopeCipher {
    lattice: Arc<Lattice>,
    domains: Arc<DomainCache>,
    keyring: Arc<dyn Keyring>,
    keys: Mutex<LruCache<(String, u32), KeyMaterial>>,
    lifecycle: Arc<KeyLifecycle>,
    sink: Arc<dyn AuditSink>,
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("active_version", &self.lifecycle.active_version())
            .finish_non_exhaustive()
    }
}

impl EnvelopeCipher {
    /// Create a cipher caching up to `key_capacity` resolved keys.
    pub fn new(
        lattice: Arc<Lattice>,
        domains: Arc<DomainCache>,
        keyring: Arc<dyn Keyring>,
        lifecycle: Arc<KeyLifecycle>,
        sink: Arc<dyn AuditSink>,
        key_capacity: usize,
    ) -> Self {
        Self {
            lattice,
            domains,
            keyring,
            keys: Mutex::new(LruCache::new(key_capacity)),
            lifecycle,
            sink,
        }
    }

    /// Domain for a label.
    pub fn domain_of(&self, label: &SecurityLabel) -> String {
        self.domains.domain_of(label)
    }

    /// Seal `plaintext` under the active key of `label`'s domain.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyUnavailable`] when the keyring cannot supply
    /// the key and [`CryptoError::EncryptionFailed`] for anything else,
    /// including labels outside the lattice.
    pub async fn encrypt(
        &self,
        label: &SecurityLabel,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let domain = self.domains.domain_of(label);
        let version = self.lifecycle.active_version();

        if !self.lattice.is_known(label) {
            self.report_failure("encrypt", &domain, version, "unknown classification");
            return Err(CryptoError::EncryptionFailed);
        }

        let key = match self.resolve_key(&domain, version).await {
            Ok(key) => key,
            Err(cause) => {
                self.report_failure("encrypt", &domain, version, &cause);
                return Err(CryptoError::KeyUnavailable { domain });
            }
        };

        let cipher = ChaCha20Poly1305::new_from_slice(key.expose()).map_err(|e| {
            self.report_failure("encrypt", &domain, version, &e.to_string());
            CryptoError::EncryptionFailed
        })?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = associated_data(&domain, version);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| {
                self.report_failure("encrypt", &domain, version, &e.to_string());
                CryptoError::EncryptionFailed
            })?;

        Ok(EncryptedEnvelope {
            ciphertext,
            nonce: nonce.to_vec(),
            key_version: version,
            algorithm_id: ALGORITHM_ID.to_owned(),
            domain,
        })
    }

    /// Open an envelope sealed under `label`'s domain.
    ///
    /// Uses the key version recorded in the envelope, so payloads sealed
    /// before a rotation remain readable.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on any failure.
    pub async fn decrypt(
        &self,
        label: &SecurityLabel,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let domain = self.domains.domain_of(label);
        let version = envelope.key_version;
        let fail = |cause: &str| {
            self.report_failure("decrypt", &domain, version, cause);
            CryptoError::DecryptionFailed
        };

        if envelope.algorithm_id != ALGORITHM_ID {
            return Err(fail("unsupported algorithm"));
        }
        if envelope.domain != domain {
            return Err(fail("domain mismatch"));
        }
        if envelope.nonce.len() != NONCE_LEN {
            return Err(fail("malformed nonce"));
        }

        let key = match self.resolve_key(&domain, version).await {
            Ok(key) => key,
            Err(cause) => return Err(fail(&cause)),
        };
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose())
            .map_err(|e| fail(&e.to_string()))?;
        let aad = associated_data(&domain, version);
        cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| fail("authentication failed"))
    }

    /// Seal a whole record under its own label.
    ///
    /// Polyinstantiated records have only their instance payload sealed.
    ///
    /// # Errors
    ///
    /// Same as [`EnvelopeCipher::encrypt`].
    pub async fn encrypt_entity(&self, entity: &Entity) -> Result<EncryptedEntity, CryptoError> {
        let label = self.lattice.label_of(entity);
        let bytes = serde_json::to_vec(entity.payload()).map_err(|e| {
            debug!(error = %e, "entity payload not serializable");
            CryptoError::EncryptionFailed
        })?;
        let envelope = self.encrypt(&label, &bytes).await?;
        Ok(EncryptedEntity {
            label,
            polyinstantiated: entity.is_polyinstantiated(),
            envelope,
        })
    }

    /// Open a record sealed by [`EnvelopeCipher::encrypt_entity`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on any failure.
    pub async fn decrypt_entity(&self, sealed: &EncryptedEntity) -> Result<Value, CryptoError> {
        let bytes = self.decrypt(&sealed.label, &sealed.envelope).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            debug!(error = %e, "decrypted entity payload is not JSON");
            CryptoError::DecryptionFailed
        })
    }

    /// Access hint for `label` on the day containing `at`.
    pub fn access_hint(&self, label: &SecurityLabel, at: DateTime<Utc>) -> Option<String> {
        access_hint(&self.lattice, label, at)
    }

    /// Drop every cached key. Cached material is zeroised as it is dropped.
    pub fn destroy_keys(&self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.clear();
        }
    }

    /// Number of keys currently cached.
    pub fn cached_keys(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    async fn resolve_key(&self, domain: &str, version: u32) -> Result<KeyMaterial, String> {
        let cache_key = (domain.to_owned(), version);
        let cached = self
            .keys
            .lock()
            .ok()
            .and_then(|mut keys| keys.get(&cache_key).cloned());
        if let Some(key) = cached {
            return Ok(key);
        }
        let key = self
            .keyring
            .get_key(domain, version)
            .await
            .map_err(|e| e.to_string())?;
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(cache_key, key.clone());
        }
        Ok(key)
    }

    fn report_failure(&self, operation: &str, domain: &str, version: u32, cause: &str) {
        debug!(operation, domain, key_version = version, cause, "crypto operation failed");
        self.sink.emit(AuditEvent::new(
            AuditEventType::CryptoFailure,
            json!({
                "operation": operation,
                "domain": domain,
                "key_version": version,
                "cause": cause,
            }),
        ));
    }
}
