//! Bell-LaPadula mandatory access control.
//!
//! - **No Read Up**: a subject reads an object only if its level ranks at
//!   or above the object's and its compartments cover the object's.
//! - **No Write Down**: a subject writes an object only if its level ranks
//!   at or below the object's and the object's compartments cover the
//!   subject's.
//!
//! Any level outside the lattice denies. Decisions are synchronous, cached
//! by canonical label pair, and emitted to the audit sink without waiting.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::event::{AuditEvent, AuditEventType};
use crate::audit::sink::AuditSink;
use crate::cache::{CacheCounters, CacheStats, LruCache};
use crate::label::{Lattice, SecurityLabel};
use crate::policy::AuditPolicy;

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Observe the object.
    Read,
    /// Modify or append to the object.
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// A MAC access denial.
///
/// The message is deliberately non-specific; the labels are carried for
/// the caller and the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("access denied: {operation} is not permitted at your clearance")]
pub struct AccessDenied {
    /// The denied operation.
    pub operation: Operation,
    /// The subject's label.
    pub subject: SecurityLabel,
    /// The object's label.
    pub object: SecurityLabel,
}

/// Outcome of one access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacDecision {
    /// Checked operation.
    pub operation: Operation,
    /// Subject label.
    pub subject_label: SecurityLabel,
    /// Object label.
    pub object_label: SecurityLabel,
    /// Whether access is permitted.
    pub allowed: bool,
}

/// Canonical cache key for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    subject_level: String,
    subject_compartments: BTreeSet<String>,
    object_level: String,
    object_compartments: BTreeSet<String>,
    operation: Operation,
}

impl DecisionKey {
    fn new(operation: Operation, subject: &SecurityLabel, object: &SecurityLabel) -> Self {
        Self {
            subject_level: subject.classification.trim().to_ascii_lowercase(),
            subject_compartments: subject.compartments.clone(),
            object_level: object.classification.trim().to_ascii_lowercase(),
            object_compartments: object.compartments.clone(),
            operation,
        }
    }
}

/// Pure No-Read-Up predicate.
pub fn read_permitted(lattice: &Lattice, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
    match (
        lattice.rank(&subject.classification),
        lattice.rank(&object.classification),
    ) {
        (Some(s), Some(o)) => s >= o && subject.compartments.is_superset(&object.compartments),
        _ => false,
    }
}

/// Pure No-Write-Down predicate.
pub fn write_permitted(lattice: &Lattice, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
    match (
        lattice.rank(&subject.classification),
        lattice.rank(&object.classification),
    ) {
        (Some(s), Some(o)) => s <= o && subject.compartments.is_subset(&object.compartments),
        _ => false,
    }
}

/// MAC decision engine with a bounded LRU decision cache.
pub struct MacEngine {
    lattice: Arc<Lattice>,
    cache: Mutex<LruCache<DecisionKey, bool>>,
    counters: CacheCounters,
    sink: Arc<dyn AuditSink>,
    audit_policy: AuditPolicy,
}

impl fmt::Debug for MacEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacEngine")
            .field("lattice", &self.lattice)
            .field("audit_policy", &self.audit_policy)
            .finish_non_exhaustive()
    }
}

impl MacEngine {
    /// Create an engine caching up to `cache_capacity` decisions.
    pub fn new(
        lattice: Arc<Lattice>,
        cache_capacity: usize,
        sink: Arc<dyn AuditSink>,
        audit_policy: AuditPolicy,
    ) -> Self {
        Self {
            lattice,
            cache: Mutex::new(LruCache::new(cache_capacity)),
            counters: CacheCounters::default(),
            sink,
            audit_policy,
        }
    }

    /// The lattice decisions are made against.
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Whether `subject` may read `object`.
    pub fn can_read(&self, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
        self.decide(Operation::Read, subject, object).allowed
    }

    /// Whether `subject` may write `object`.
    pub fn can_write(&self, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
        self.decide(Operation::Write, subject, object).allowed
    }

    /// Require No Read Up.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] when the read is not permitted.
    pub fn enforce_no_read_up(
        &self,
        subject: &SecurityLabel,
        object: &SecurityLabel,
    ) -> Result<(), AccessDenied> {
        self.enforce(Operation::Read, subject, object)
    }

    /// Require No Write Down.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] when the write is not permitted.
    pub fn enforce_no_write_down(
        &self,
        subject: &SecurityLabel,
        object: &SecurityLabel,
    ) -> Result<(), AccessDenied> {
        self.enforce(Operation::Write, subject, object)
    }

    fn enforce(
        &self,
        operation: Operation,
        subject: &SecurityLabel,
        object: &SecurityLabel,
    ) -> Result<(), AccessDenied> {
        let decision = self.decide(operation, subject, object);
        if decision.allowed {
            return Ok(());
        }
        warn!(%operation, subject = %subject, object = %object, "MAC violation");
        self.sink.emit(AuditEvent::new(
            AuditEventType::MacViolation,
            json!({
                "operation": operation,
                "subject": subject,
                "object": object,
            }),
        ));
        Err(AccessDenied {
            operation,
            subject: subject.clone(),
            object: object.clone(),
        })
    }

    /// Make (or recall) a decision and emit it for audit.
    pub fn decide(
        &self,
        operation: Operation,
        subject: &SecurityLabel,
        object: &SecurityLabel,
    ) -> MacDecision {
        let key = DecisionKey::new(operation, subject, object);
        let cached = self
            .cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&key).copied());

        let (allowed, cache_hit) = match cached {
            Some(allowed) => {
                self.counters.hit();
                (allowed, true)
            }
            None => {
                self.counters.miss();
                let allowed = match operation {
                    Operation::Read => read_permitted(&self.lattice, subject, object),
                    Operation::Write => write_permitted(&self.lattice, subject, object),
                };
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key, allowed);
                }
                (allowed, false)
            }
        };

        let decision = MacDecision {
            operation,
            subject_label: subject.clone(),
            object_label: object.clone(),
            allowed,
        };
        debug!(%operation, allowed, cache_hit, "MAC decision");

        if self.audit_policy.should_record(&decision, cache_hit) {
            self.sink.emit(AuditEvent::new(
                AuditEventType::MacDecision,
                json!({
                    "operation": operation,
                    "subject": subject,
                    "object": object,
                    "allowed": allowed,
                    "cache_hit": cache_hit,
                }),
            ));
        }
        decision
    }

    /// Decision cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        let len = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        self.counters.snapshot(len)
    }
}
