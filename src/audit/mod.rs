//! Forensic audit: event vocabulary, payload sanitisation, the hash-linked
//! chain and the non-blocking sink that feeds it.

pub mod chain;
pub mod event;
pub mod sanitize;
pub mod sink;

pub use chain::{
    verify_envelopes, AuditChain, AuditEnvelope, AuditError, ChainVerification, EvictionGap,
    VerifyOptions,
};
pub use event::{AuditContext, AuditEvent, AuditEventType};
pub use sink::{run_audit_writer, AuditSink, ChannelSink, NullSink};
