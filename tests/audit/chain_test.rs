//! Chain integrity and commit policy.

use std::sync::Arc;

use seckernel::audit::chain::{
    verify_envelopes, AuditChain, AuditError, VerifyOptions, GENESIS_HASH,
};
use seckernel::audit::sanitize::SanitizeLimits;
use seckernel::audit::sink::NullSink;
use seckernel::audit::{AuditContext, AuditEvent, AuditEventType};
use seckernel::crypto::domain::DomainCache;
use seckernel::crypto::InMemoryKeyring;
use seckernel::policy::{AuditPolicy, Environment, PolicyValue, StaticPolicy, KEY_ALLOW_UNSIGNED_AUDIT};
use seckernel::signing::signer::AUDIT_SIGNING_DOMAIN;
use seckernel::signing::NonRepudiationSigner;
use serde_json::json;

fn signer() -> Arc<NonRepudiationSigner> {
    Arc::new(NonRepudiationSigner::new(
        Arc::new(InMemoryKeyring::new([41u8; 32])),
        Arc::new(DomainCache::new(8)),
        Arc::new(NullSink),
    ))
}

fn signed_chain(capacity: usize) -> AuditChain {
    AuditChain::new(
        capacity,
        Some(signer()),
        AuditPolicy::default(),
        SanitizeLimits::default(),
    )
}

async fn audit_key() -> String {
    signer().public_key(AUDIT_SIGNING_DOMAIN).await.expect("audit key")
}

#[tokio::test]
async fn sequential_commits_verify_and_any_payload_edit_is_located() {
    let chain = signed_chain(64);
    let mut envelopes = Vec::new();
    for n in 0..10 {
        envelopes.push(
            chain
                .log_event(AuditEvent::new(AuditEventType::MacDecision, json!({ "n": n })))
                .await
                .expect("commit"),
        );
    }
    assert_eq!(envelopes.first().map(|e| e.previous_hash.as_str()), Some(GENESIS_HASH));
    assert!(chain.verify_chain().await.expect("verify").valid);

    let key = audit_key().await;
    let options = VerifyOptions {
        trusted_key: Some(&key),
        ..VerifyOptions::default()
    };
    for position in 0..envelopes.len() {
        let mut tampered = envelopes.clone();
        if let Some(target) = tampered.get_mut(position) {
            target.payload = json!({ "n": "forged" });
        }
        let result = verify_envelopes(&tampered, &options);
        assert!(!result.valid);
        assert_eq!(result.broken_at, envelopes.get(position).map(|e| e.id));
    }
}

#[tokio::test]
async fn relinking_a_forged_envelope_still_breaks_the_signature() {
    let chain = signed_chain(16);
    let mut envelopes = Vec::new();
    for n in 0..3 {
        envelopes.push(
            chain
                .log_event(AuditEvent::new(AuditEventType::Lineage, json!({ "n": n })))
                .await
                .expect("commit"),
        );
    }
    // Recompute the payload hash so only the signature can catch the edit.
    if let Some(middle) = envelopes.get_mut(1) {
        middle.payload = json!({ "n": 42 });
        middle.payload_hash = seckernel::audit::sanitize::digest(&middle.payload);
    }
    let key = audit_key().await;
    let options = VerifyOptions {
        trusted_key: Some(&key),
        ..VerifyOptions::default()
    };
    let result = verify_envelopes(&envelopes, &options);
    assert_eq!(result.broken_at, Some(2));
}

#[tokio::test]
async fn defense_deployment_refuses_unsigned_events() {
    let source = StaticPolicy::new()
        .with(KEY_ALLOW_UNSIGNED_AUDIT, PolicyValue::Bool(true))
        .with("deployment.environment", PolicyValue::Text("defense".to_owned()));
    let policy = AuditPolicy::resolve(Some(&source), Environment::Production);
    assert_eq!(policy.environment(), Environment::Defense);

    let chain = AuditChain::new(16, None, policy, SanitizeLimits::default());
    let err = chain
        .log_event(AuditEvent::new(AuditEventType::MacViolation, json!({})))
        .await
        .expect_err("refused");
    assert!(matches!(
        err,
        AuditError::UnsignedAuditRejected {
            event_type: AuditEventType::MacViolation
        }
    ));
    assert_eq!(chain.buffered(), 0);
}

#[tokio::test]
async fn typed_payloads_must_be_json_representable() {
    let chain = signed_chain(16);
    let mut bad = std::collections::BTreeMap::new();
    bad.insert(vec![1u8], "value");
    let err = chain
        .log(AuditEventType::Lineage, &bad, AuditContext::default())
        .await
        .expect_err("non-string keys");
    assert!(matches!(err, AuditError::Sanitize(_)));

    let ok = chain
        .log(
            AuditEventType::Lineage,
            &json!({"user": "alice"}),
            AuditContext {
                user_id: Some("alice".to_owned()),
                ..AuditContext::default()
            },
        )
        .await
        .expect("commit");
    assert_eq!(ok.context.user_id.as_deref(), Some("alice"));
}

#[tokio::test]
async fn overflow_eviction_is_observable() {
    let chain = signed_chain(3);
    for n in 0..5 {
        chain
            .log_event(AuditEvent::new(AuditEventType::MacDecision, json!({ "n": n })))
            .await
            .expect("commit");
    }
    assert_eq!(chain.buffered(), 3);
    assert_eq!(chain.evicted(), 2);
}
