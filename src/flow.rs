//! Information-flow validation for derived data.
//!
//! Data derived from several sources must be labelled at least as high as
//! the highest source and must carry every source compartment. A failed
//! derivation is both returned to the caller and audited as a critical
//! event; a successful one leaves a lineage record behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::event::{AuditContext, AuditEvent, AuditEventType};
use crate::audit::sink::AuditSink;
use crate::label::{Lattice, SecurityLabel};

/// A derivation that would leak data downward or out of a compartment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("derivation not permitted: result label does not dominate its sources")]
pub struct FlowViolation {
    /// Labels of the inputs.
    pub sources: Vec<SecurityLabel>,
    /// Requested label of the result.
    pub derived: SecurityLabel,
}

/// Provenance of one permitted derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    /// Ties the lineage event to the caller's operation.
    pub correlation_id: Uuid,
    /// Labels of the inputs.
    pub sources: Vec<SecurityLabel>,
    /// Label of the result.
    pub derived: SecurityLabel,
    /// Caller-supplied operation metadata.
    pub metadata: Value,
    /// When the derivation was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Pure derivation check.
///
/// An empty source list is trivially satisfied when the derived level is
/// known.
pub fn derivation_permitted(lattice: &Lattice, sources: &[SecurityLabel], derived: &SecurityLabel) -> bool {
    let Some(derived_rank) = lattice.rank(&derived.classification) else {
        return false;
    };
    let mut required: BTreeSet<&String> = BTreeSet::new();
    for source in sources {
        match lattice.rank(&source.classification) {
            Some(rank) if rank <= derived_rank => required.extend(source.compartments.iter()),
            _ => return false,
        }
    }
    required.into_iter().all(|c| derived.compartments.contains(c))
}

/// Validates derivations and records lineage.
pub struct FlowValidator {
    lattice: Arc<Lattice>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for FlowValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowValidator").finish_non_exhaustive()
    }
}

impl FlowValidator {
    /// Create a validator.
    pub fn new(lattice: Arc<Lattice>, sink: Arc<dyn AuditSink>) -> Self {
        Self { lattice, sink }
    }

    /// Whether `derived` may hold data combined from `sources`.
    pub fn validate_derivation(&self, sources: &[SecurityLabel], derived: &SecurityLabel) -> bool {
        derivation_permitted(&self.lattice, sources, derived)
    }

    /// Check a derivation, audit the outcome and return its lineage.
    ///
    /// # Errors
    ///
    /// Returns [`FlowViolation`] when the derivation is not permitted.
    pub fn derived(
        &self,
        sources: &[SecurityLabel],
        derived: &SecurityLabel,
        metadata: Value,
    ) -> Result<LineageRecord, FlowViolation> {
        self.derived_in(sources, derived, metadata, AuditContext::default())
    }

    /// As [`FlowValidator::derived`], attributing the audit events.
    ///
    /// # Errors
    ///
    /// Returns [`FlowViolation`] when the derivation is not permitted.
    pub fn derived_in(
        &self,
        sources: &[SecurityLabel],
        derived: &SecurityLabel,
        metadata: Value,
        context: AuditContext,
    ) -> Result<LineageRecord, FlowViolation> {
        if !self.validate_derivation(sources, derived) {
            warn!(derived = %derived, sources = sources.len(), "information flow violation");
            self.sink.emit(
                AuditEvent::new(
                    AuditEventType::FlowViolation,
                    json!({
                        "sources": sources,
                        "derived": derived,
                        "metadata": metadata,
                    }),
                )
                .with_context(context),
            );
            return Err(FlowViolation {
                sources: sources.to_vec(),
                derived: derived.clone(),
            });
        }

        let record = LineageRecord {
            correlation_id: Uuid::new_v4(),
            sources: sources.to_vec(),
            derived: derived.clone(),
            metadata,
            recorded_at: Utc::now(),
        };
        debug!(correlation_id = %record.correlation_id, derived = %derived, "lineage recorded");
        self.sink.emit(
            AuditEvent::new(
                AuditEventType::Lineage,
                json!({
                    "sources": record.sources,
                    "derived": record.derived,
                    "metadata": record.metadata,
                }),
            )
            .with_context(AuditContext {
                correlation_id: Some(record.correlation_id),
                ..context
            }),
        );
        Ok(record)
    }
}
