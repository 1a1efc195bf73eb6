//! Audit event vocabulary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A MAC read or write decision was made.
    MacDecision,
    /// A MAC check was enforced and denied.
    MacViolation,
    /// A derivation failed the write-up or compartment rule.
    FlowViolation,
    /// A derivation succeeded; records its provenance.
    Lineage,
    /// The envelope key version changed.
    KeyRotation,
    /// Key material and history were destroyed.
    KeysDestroyed,
    /// An encrypt or decrypt call failed.
    CryptoFailure,
    /// A non-repudiation signature was issued.
    ActionSigned,
    /// The active security context was replaced or cleared.
    ContextChange,
}

impl AuditEventType {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacDecision => "mac_decision",
            Self::MacViolation => "mac_violation",
            Self::FlowViolation => "flow_violation",
            Self::Lineage => "lineage",
            Self::KeyRotation => "key_rotation",
            Self::KeysDestroyed => "keys_destroyed",
            Self::CryptoFailure => "crypto_failure",
            Self::ActionSigned => "action_signed",
            Self::ContextChange => "context_change",
        }
    }

    /// Whether losing this event would hide a security incident.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::MacViolation | Self::FlowViolation | Self::CryptoFailure | Self::KeysDestroyed
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who and what an audit event is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    /// Acting user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Tenant of the acting user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Correlates events produced by one logical operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// An event handed to the audit sink, before it becomes an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event type.
    pub event_type: AuditEventType,
    /// Unsanitised event payload.
    pub payload: Value,
    /// Attribution.
    pub context: AuditContext,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped now with an empty context.
    pub fn new(event_type: AuditEventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            context: AuditContext::default(),
            timestamp: Utc::now(),
        }
    }

    /// Attach attribution.
    pub fn with_context(mut self, context: AuditContext) -> Self {
        self.context = context;
        self
    }
}
