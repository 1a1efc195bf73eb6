//! Non-repudiation signing.
//!
//! Each crypto domain gets its own Ed25519 key pair, derived by the keyring
//! for `(NON_REPUDIATION_PURPOSE, domain)`. Action signatures cover the
//! canonical JSON of `{action, label, timestamp, user_id}`.

use std::fmt;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::audit::event::{AuditContext, AuditEvent, AuditEventType};
use crate::audit::sanitize::canonical_bytes;
use crate::audit::sink::AuditSink;
use crate::cache::LruCache;
use crate::crypto::domain::DomainCache;
use crate::crypto::keyring::{Keyring, KeyringError};
use crate::label::SecurityLabel;

/// Signature algorithm recorded in every [`ActionSignature`].
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Keyring purpose for signing seeds.
pub const NON_REPUDIATION_PURPOSE: &str = "non-repudiation";

/// Domain whose key signs audit envelopes.
pub const AUDIT_SIGNING_DOMAIN: &str = "audit::chain";

const SIGNING_KEY_CACHE: usize = 64;

/// Signer error types.
#[derive(Debug, Error)]
pub enum SignerError {
    /// The keyring could not supply a signing seed.
    #[error("signing key unavailable: {0}")]
    Keyring(#[from] KeyringError),
    /// The payload could not be canonicalised.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What an action signature attests to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    /// Acting user.
    pub user_id: String,
    /// Action performed.
    pub action: String,
    /// Label of the data acted on.
    pub label: SecurityLabel,
    /// When the action was signed.
    pub timestamp: DateTime<Utc>,
}

impl ActionPayload {
    /// Canonical bytes covered by the signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn canonical(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(canonical_bytes(&serde_json::to_value(self)?))
    }
}

/// A detached signature over an [`ActionPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSignature {
    /// Base64 Ed25519 signature.
    pub signature: String,
    /// Always [`SIGNATURE_ALGORITHM`].
    pub algorithm: String,
    /// Timestamp the signature covers.
    pub timestamp: DateTime<Utc>,
    /// Base64 verifying key of the signing domain.
    pub public_key: String,
}

/// Issues and checks Ed25519 signatures, one key pair per domain.
pub struct NonRepudiationSigner {
    keyring: Arc<dyn Keyring>,
    domains: Arc<DomainCache>,
    keys: Mutex<LruCache<String, SigningKey>>,
    sink: Arc<dyn AuditSink>,
}

impl fmt::Debug for NonRepudiationSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonRepudiationSigner").finish_non_exhaustive()
    }
}

impl NonRepudiationSigner {
    /// Create a signer.
    pub fn new(keyring: Arc<dyn Keyring>, domains: Arc<DomainCache>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            keyring,
            domains,
            keys: Mutex::new(LruCache::new(SIGNING_KEY_CACHE)),
            sink,
        }
    }

    /// Sign that `user_id` performed `action` on data labelled `label`.
    ///
    /// # Errors
    ///
    /// Fails when the keyring cannot supply the domain's signing seed.
    pub async fn sign_action(
        &self,
        user_id: &str,
        action: &str,
        label: &SecurityLabel,
    ) -> Result<ActionSignature, SignerError> {
        let payload = ActionPayload {
            user_id: user_id.to_owned(),
            action: action.to_owned(),
            label: label.clone(),
            timestamp: Utc::now(),
        };
        let message = payload.canonical()?;
        let domain = self.domains.domain_of(label);
        let key = self.signing_key(&domain).await?;
        let signature = key.sign(&message);

        self.sink.emit(
            AuditEvent::new(
                AuditEventType::ActionSigned,
                json!({ "action": action, "domain": domain }),
            )
            .with_context(AuditContext {
                user_id: Some(user_id.to_owned()),
                ..AuditContext::default()
            }),
        );

        Ok(ActionSignature {
            signature: STANDARD.encode(signature.to_bytes()),
            algorithm: SIGNATURE_ALGORITHM.to_owned(),
            timestamp: payload.timestamp,
            public_key: STANDARD.encode(key.verifying_key().to_bytes()),
        })
    }

    /// Check `signature` against `payload`.
    ///
    /// The verifying key is `public_key` when given, otherwise the key the
    /// keyring derives for the payload label's domain. The key embedded in
    /// the signature is never trusted; it must match the verifying key.
    /// Any malformed input or keyring failure yields `false`.
    pub async fn verify_signature(
        &self,
        signature: &ActionSignature,
        payload: &ActionPayload,
        public_key: Option<&VerifyingKey>,
    ) -> bool {
        if signature.algorithm != SIGNATURE_ALGORITHM || signature.timestamp != payload.timestamp {
            return false;
        }
        let Ok(message) = payload.canonical() else {
            return false;
        };
        let key = match public_key {
            Some(key) => *key,
            None => {
                let domain = self.domains.domain_of(&payload.label);
                match self.signing_key(&domain).await {
                    Ok(key) => key.verifying_key(),
                    Err(e) => {
                        debug!(error = %e, domain = %domain, "no verifying key for domain");
                        return false;
                    }
                }
            }
        };
        if decode_verifying_key(&signature.public_key) != Some(key) {
            debug!("embedded public key does not match the verifying key");
            return false;
        }
        verify_with(&key, &message, &signature.signature)
    }

    /// Sign raw bytes with `domain`'s key. Returns base64 signature and key.
    ///
    /// # Errors
    ///
    /// Fails when the keyring cannot supply the domain's signing seed.
    pub async fn sign_bytes(&self, domain: &str, message: &[u8]) -> Result<(String, String), SignerError> {
        let key = self.signing_key(domain).await?;
        let signature = key.sign(message);
        Ok((
            STANDARD.encode(signature.to_bytes()),
            STANDARD.encode(key.verifying_key().to_bytes()),
        ))
    }

    /// Check a base64 signature over `message` against a base64 key.
    pub fn verify_bytes(public_key: &str, message: &[u8], signature: &str) -> bool {
        match decode_verifying_key(public_key) {
            Some(key) => verify_with(&key, message, signature),
            None => false,
        }
    }

    /// Base64 verifying key for `domain`.
    ///
    /// # Errors
    ///
    /// Fails when the keyring cannot supply the domain's signing seed.
    pub async fn public_key(&self, domain: &str) -> Result<String, SignerError> {
        let key = self.signing_key(domain).await?;
        Ok(STANDARD.encode(key.verifying_key().to_bytes()))
    }

    /// Drop every cached signing key.
    pub fn forget_keys(&self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.clear();
        }
    }

    async fn signing_key(&self, domain: &str) -> Result<SigningKey, SignerError> {
        let cached = self
            .keys
            .lock()
            .ok()
            .and_then(|mut keys| keys.get(&domain.to_owned()).cloned());
        if let Some(key) = cached {
            return Ok(key);
        }
        let seed = self
            .keyring
            .derive_signing_key(NON_REPUDIATION_PURPOSE, domain)
            .await?;
        let key = SigningKey::from_bytes(seed.expose());
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(domain.to_owned(), key.clone());
        }
        Ok(key)
    }
}

/// Decode a base64 Ed25519 verifying key.
pub fn decode_verifying_key(encoded: &str) -> Option<VerifyingKey> {
    let bytes = STANDARD.decode(encoded).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn verify_with(key: &VerifyingKey, message: &[u8], signature: &str) -> bool {
    let Ok(bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    match key.verify(message, &signature) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "signature verification failed");
            false
        }
    }
}
