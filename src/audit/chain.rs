//! Tamper-evident audit chain.
//!
//! Each committed event becomes an [`AuditEnvelope`] linked to its
//! predecessor by hash and, when a signer is configured, signed with the
//! audit domain's Ed25519 key. Envelopes wait in a bounded FIFO buffer until
//! a durable store is attached and [`AuditChain::flush`] moves them out.
//!
//! Commits are serialised by the chain-head mutex. Flushes are serialised by
//! a separate mutex taken with `try_lock`, so at most one flush runs and a
//! concurrent caller returns immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::event::{AuditContext, AuditEvent, AuditEventType};
use super::sanitize::{canonical_bytes, digest, sanitize, to_payload, SanitizeError, SanitizeLimits};
use crate::policy::AuditPolicy;
use crate::signing::signer::{NonRepudiationSigner, AUDIT_SIGNING_DOMAIN};
use crate::store::{record_key, DurableStore, StoreError};

/// `previous_hash` of the first envelope.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Durable store holding audit envelopes.
pub const AUDIT_STORE: &str = "audit_log";

const MAX_TRACKED_GAPS: usize = 256;

/// Audit chain error types.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The payload could not be represented as JSON.
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),
    /// Policy requires signatures and the envelope could not be signed.
    #[error("unsigned audit envelope rejected for {event_type}")]
    UnsignedAuditRejected {
        /// Type of the refused event.
        event_type: AuditEventType,
    },
    /// The chain failed verification.
    #[error("audit chain broken at envelope {broken_at}")]
    ChainIntegrity {
        /// Id of the first envelope that failed.
        broken_at: u64,
    },
    /// The durable store failed.
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),
    /// A persisted record is not a valid envelope.
    #[error("malformed audit record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One link of the audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEnvelope {
    /// Monotonic id starting at 1.
    pub id: u64,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    /// Sanitised payload.
    pub payload: Value,
    /// Attribution.
    pub context: AuditContext,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hex of the canonical payload.
    pub payload_hash: String,
    /// Base64 Ed25519 signature over [`AuditEnvelope::signing_material`].
    pub signature: Option<String>,
    /// Base64 verifying key of the signer.
    pub public_key: Option<String>,
    /// Whether `signature` is present and was produced at commit.
    pub signed: bool,
    /// [`AuditEnvelope::envelope_hash`] of the predecessor, or [`GENESIS_HASH`].
    pub previous_hash: String,
}

impl AuditEnvelope {
    /// Canonical bytes covered by the signature.
    pub fn signing_material(&self) -> Vec<u8> {
        canonical_bytes(&json!({
            "id": self.id,
            "type": self.event_type,
            "context": self.context,
            "timestamp": self.timestamp,
            "payload_hash": self.payload_hash,
            "previous_hash": self.previous_hash,
        }))
    }

    /// Hash the successor links to. Covers the signature as well.
    pub fn envelope_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_material());
        if let Some(signature) = &self.signature {
            hasher.update(signature.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Result of walking the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    /// Whether every envelope checked out.
    pub valid: bool,
    /// Id of the first envelope that did not.
    pub broken_at: Option<u64>,
    /// Envelopes examined.
    pub checked: usize,
}

impl ChainVerification {
    /// Convert an invalid result into [`AuditError::ChainIntegrity`].
    ///
    /// # Errors
    ///
    /// Returns the error when the chain is broken.
    pub fn into_result(self) -> Result<usize, AuditError> {
        match self.broken_at {
            Some(broken_at) => Err(AuditError::ChainIntegrity { broken_at }),
            None => Ok(self.checked),
        }
    }
}

/// Where a chain legitimately resumes after buffered envelopes were evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionGap {
    /// Id of the first envelope after the gap.
    pub resume_id: u64,
    /// [`AuditEnvelope::envelope_hash`] of the last evicted envelope.
    pub resume_hash: String,
}

/// What [`verify_envelopes`] trusts.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    /// Base64 audit signing key. Signed envelopes fail without it; the key
    /// an envelope carries is never trusted on its own.
    pub trusted_key: Option<&'a str>,
    /// Whether unsigned envelopes are acceptable.
    pub allow_unsigned: bool,
    /// Gaps the live chain recorded when it evicted unflushed envelopes.
    pub gaps: &'a [EvictionGap],
}

/// Verify a contiguous run of envelopes.
///
/// A run starting at id 1 must link to [`GENESIS_HASH`]; a run starting
/// later (after retention pruning) is anchored at its first record. Checks
/// id sequence, hash link, payload hash and signature. An id jump is
/// accepted only where it matches one of `options.gaps`.
pub fn verify_envelopes(envelopes: &[AuditEnvelope], options: &VerifyOptions<'_>) -> ChainVerification {
    let mut expected: Option<(u64, String)> = None;
    let mut checked: usize = 0;

    for envelope in envelopes {
        checked = checked.saturating_add(1);
        let (id_ok, link_ok) = match &expected {
            Some((id, prev)) if envelope.id == *id && envelope.previous_hash == *prev => (true, true),
            Some((id, prev)) => {
                let resumed = envelope.id > *id
                    && options.gaps.iter().any(|gap| {
                        gap.resume_id == envelope.id && gap.resume_hash == envelope.previous_hash
                    });
                (resumed || envelope.id == *id, resumed || envelope.previous_hash == *prev)
            }
            None => (
                envelope.id >= 1,
                envelope.id != 1 || envelope.previous_hash == GENESIS_HASH,
            ),
        };
        let payload_ok = envelope.payload_hash == digest(&envelope.payload);
        let signature_ok = envelope_signature_ok(envelope, options);

        if !(id_ok && link_ok && payload_ok && signature_ok) {
            debug!(
                id = envelope.id,
                id_ok, link_ok, payload_ok, signature_ok, "audit envelope failed verification"
            );
            return ChainVerification {
                valid: false,
                broken_at: Some(envelope.id),
                checked,
            };
        }

        expected = Some((envelope.id.saturating_add(1), envelope.envelope_hash()));
    }

    ChainVerification {
        valid: true,
        broken_at: None,
        checked,
    }
}

fn envelope_signature_ok(envelope: &AuditEnvelope, options: &VerifyOptions<'_>) -> bool {
    match (&envelope.signature, envelope.signed) {
        (None, false) => options.allow_unsigned && envelope.public_key.is_none(),
        (Some(signature), true) => {
            let Some(trusted) = options.trusted_key else {
                return false;
            };
            envelope.public_key.as_deref() == Some(trusted)
                && NonRepudiationSigner::verify_bytes(trusted, &envelope.signing_material(), signature)
        }
        _ => false,
    }
}

struct ChainHead {
    next_id: u64,
    last_hash: String,
}

/// Bounded, signed, hash-linked audit log.
pub struct AuditChain {
    head: tokio::sync::Mutex<ChainHead>,
    buffer: Mutex<VecDeque<AuditEnvelope>>,
    capacity: usize,
    evicted: AtomicU64,
    signer: Option<Arc<NonRepudiationSigner>>,
    policy: AuditPolicy,
    limits: SanitizeLimits,
    store: RwLock<Option<Arc<dyn DurableStore>>>,
    flush_lock: tokio::sync::Mutex<()>,
    gaps: Mutex<Vec<EvictionGap>>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("capacity", &self.capacity)
            .field("buffered", &self.buffered())
            .field("evicted", &self.evicted())
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl AuditChain {
    /// Create an empty chain buffering up to `capacity` envelopes.
    pub fn new(
        capacity: usize,
        signer: Option<Arc<NonRepudiationSigner>>,
        policy: AuditPolicy,
        limits: SanitizeLimits,
    ) -> Self {
        Self {
            head: tokio::sync::Mutex::new(ChainHead {
                next_id: 1,
                last_hash: GENESIS_HASH.to_owned(),
            }),
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
            signer,
            policy,
            limits,
            store: RwLock::new(None),
            flush_lock: tokio::sync::Mutex::new(()),
            gaps: Mutex::new(Vec::new()),
        }
    }

    /// Envelopes waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Envelopes dropped from the buffer on overflow.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Audit policy this chain enforces.
    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    /// Commit an arbitrary serializable payload.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sanitize`] when the payload is not
    /// representable as JSON, otherwise as [`AuditChain::log_event`].
    pub async fn log<T: Serialize>(
        &self,
        event_type: AuditEventType,
        payload: &T,
        context: AuditContext,
    ) -> Result<AuditEnvelope, AuditError> {
        let payload = to_payload(payload)?;
        self.log_event(AuditEvent::new(event_type, payload).with_context(context))
            .await
    }

    /// Sanitise, hash, link, sign and buffer one event.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::UnsignedAuditRejected`] when the envelope could
    /// not be signed and policy forbids unsigned envelopes. The chain head
    /// does not advance in that case.
    pub async fn log_event(&self, event: AuditEvent) -> Result<AuditEnvelope, AuditError> {
        let payload = sanitize(&event.payload, &self.limits);
        let payload_hash = digest(&payload);

        let mut head = self.head.lock().await;
        let mut envelope = AuditEnvelope {
            id: head.next_id,
            event_type: event.event_type,
            payload,
            context: event.context,
            timestamp: event.timestamp,
            payload_hash,
            signature: None,
            public_key: None,
            signed: false,
            previous_hash: head.last_hash.clone(),
        };
        self.seal(&mut envelope).await;

        if !envelope.signed && !self.policy.allow_unsigned() {
            error!(
                event_type = %envelope.event_type,
                environment = %self.policy.environment(),
                "unsigned audit envelope refused"
            );
            return Err(AuditError::UnsignedAuditRejected {
                event_type: envelope.event_type,
            });
        }

        head.last_hash = envelope.envelope_hash();
        head.next_id = head.next_id.saturating_add(1);
        self.enqueue_back(envelope.clone());
        Ok(envelope)
    }

    /// Attach the durable store.
    ///
    /// The chain resumes from the last persisted envelope. Envelopes buffered
    /// before attachment are renumbered, re-linked onto it and re-signed.
    ///
    /// # Errors
    ///
    /// Returns an error when the persisted chain cannot be read. Returns
    /// [`AuditError::UnsignedAuditRejected`] when a buffered envelope cannot
    /// be re-signed and policy forbids unsigned envelopes; the store is then
    /// not attached and the buffer is left as it was.
    pub async fn attach_store(&self, store: Arc<dyn DurableStore>) -> Result<(), AuditError> {
        let mut head = self.head.lock().await;
        let _flush = self.flush_lock.lock().await;

        let records = store.list(AUDIT_STORE).await?;
        if let Some((_, last)) = records.last() {
            let last: AuditEnvelope = serde_json::from_value(last.clone())?;
            let mut next_id = last.id.saturating_add(1);
            let mut last_hash = last.envelope_hash();

            let pending: Vec<AuditEnvelope> = self
                .buffer
                .lock()
                .map(|mut b| b.drain(..).collect())
                .unwrap_or_default();
            let mut rebased = Vec::with_capacity(pending.len());
            let mut refused = None;
            for original in &pending {
                let mut envelope = original.clone();
                envelope.id = next_id;
                envelope.previous_hash = last_hash.clone();
                self.seal(&mut envelope).await;
                if !envelope.signed && !self.policy.allow_unsigned() {
                    refused = Some(envelope.event_type);
                    break;
                }
                last_hash = envelope.envelope_hash();
                next_id = next_id.saturating_add(1);
                rebased.push(envelope);
            }
            if let Some(event_type) = refused {
                self.requeue_front(pending);
                error!(
                    event_type = %event_type,
                    "buffered audit envelopes could not be re-signed, store not attached"
                );
                return Err(AuditError::UnsignedAuditRejected { event_type });
            }

            self.requeue_front(rebased);
            if let Ok(mut gaps) = self.gaps.lock() {
                gaps.clear();
            }
            head.next_id = next_id;
            head.last_hash = last_hash;
            info!(resume_at = head.next_id, "audit chain resumed from store");
        }

        *self.store.write().await = Some(store);
        Ok(())
    }

    /// Write buffered envelopes to the store in order.
    ///
    /// Returns the number written. Without a store, or while another flush
    /// is running, returns `Ok(0)` and leaves the buffer untouched. On a
    /// store failure the unwritten envelopes go back to the front of the
    /// buffer in their original order.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn flush(&self) -> Result<usize, AuditError> {
        let Ok(_flush) = self.flush_lock.try_lock() else {
            debug!("audit flush already in progress");
            return Ok(0);
        };
        let Some(store) = self.store.read().await.clone() else {
            return Ok(0);
        };

        let batch: Vec<AuditEnvelope> = self
            .buffer
            .lock()
            .map(|mut b| b.drain(..).collect())
            .unwrap_or_default();
        let mut written: usize = 0;
        let mut pending = batch.into_iter();

        while let Some(envelope) = pending.next() {
            let result = match serde_json::to_value(&envelope) {
                Ok(record) => store
                    .put(AUDIT_STORE, &record_key(envelope.id), &record)
                    .await
                    .map_err(AuditError::from),
                Err(e) => Err(AuditError::from(e)),
            };
            if let Err(err) = result {
                let failed_id = envelope.id;
                self.requeue_front(std::iter::once(envelope).chain(pending).collect());
                warn!(id = failed_id, written, error = %err, "audit flush interrupted");
                return Err(err);
            }
            written = written.saturating_add(1);
        }

        if written > 0 {
            debug!(written, "audit envelopes flushed");
        }
        Ok(written)
    }

    /// Verify the persisted chain followed by the buffered tail.
    ///
    /// Signed envelopes must verify under the signer's audit key. Unsigned
    /// envelopes pass only when policy allows them. Gaps left by buffer
    /// eviction are accepted where this chain recorded them.
    ///
    /// # Errors
    ///
    /// Returns an error when persisted records cannot be read or decoded.
    pub async fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let _flush = self.flush_lock.lock().await;
        let mut envelopes = Vec::new();

        let store = self.store.read().await.clone();
        if let Some(store) = store {
            for (_, record) in store.list(AUDIT_STORE).await? {
                envelopes.push(serde_json::from_value::<AuditEnvelope>(record)?);
            }
        }
        if let Ok(buffer) = self.buffer.lock() {
            envelopes.extend(buffer.iter().cloned());
        }

        let trusted = match &self.signer {
            Some(signer) => signer.public_key(AUDIT_SIGNING_DOMAIN).await.ok(),
            None => None,
        };
        let gaps = self.gaps.lock().map(|g| g.clone()).unwrap_or_default();
        let verification = verify_envelopes(
            &envelopes,
            &VerifyOptions {
                trusted_key: trusted.as_deref(),
                allow_unsigned: self.policy.allow_unsigned(),
                gaps: &gaps,
            },
        );
        if !verification.valid {
            warn!(broken_at = ?verification.broken_at, "audit chain verification failed");
        }
        Ok(verification)
    }

    async fn seal(&self, envelope: &mut AuditEnvelope) {
        envelope.signature = None;
        envelope.public_key = None;
        envelope.signed = false;
        let Some(signer) = &self.signer else {
            return;
        };
        match signer
            .sign_bytes(AUDIT_SIGNING_DOMAIN, &envelope.signing_material())
            .await
        {
            Ok((signature, public_key)) => {
                envelope.signature = Some(signature);
                envelope.public_key = Some(public_key);
                envelope.signed = true;
            }
            Err(e) => warn!(id = envelope.id, error = %e, "audit envelope signing failed"),
        }
    }

    fn enqueue_back(&self, envelope: AuditEnvelope) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_back(envelope);
            self.evict_overflow(&mut buffer);
        }
    }

    fn requeue_front(&self, envelopes: Vec<AuditEnvelope>) {
        if let Ok(mut buffer) = self.buffer.lock() {
            for envelope in envelopes.into_iter().rev() {
                buffer.push_front(envelope);
            }
            self.evict_overflow(&mut buffer);
        }
    }

    fn evict_overflow(&self, buffer: &mut VecDeque<AuditEnvelope>) {
        while buffer.len() > self.capacity {
            if let Some(dropped) = buffer.pop_front() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(id = dropped.id, event_type = %dropped.event_type, "audit buffer full, oldest envelope evicted");
                self.record_gap(&dropped);
            }
        }
    }

    fn record_gap(&self, dropped: &AuditEnvelope) {
        let Ok(mut gaps) = self.gaps.lock() else {
            return;
        };
        let gap = EvictionGap {
            resume_id: dropped.id.saturating_add(1),
            resume_hash: dropped.envelope_hash(),
        };
        // Consecutive evictions widen the same gap.
        match gaps.last_mut() {
            Some(last) if last.resume_id == dropped.id => *last = gap,
            _ => gaps.push(gap),
        }
        if gaps.len() > MAX_TRACKED_GAPS {
            gaps.remove(0);
        }
    }
}
