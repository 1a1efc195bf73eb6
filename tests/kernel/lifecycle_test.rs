//! Key lifecycle scheduling, persistence and signatures.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use seckernel::audit::sink::NullSink;
use seckernel::crypto::InMemoryKeyring;
use seckernel::signing::rotation::{KeyLifecycle, RotationConfig, KEY_HISTORY_STORE};
use seckernel::signing::signer::{
    decode_verifying_key, ActionPayload, ActionSignature, SIGNATURE_ALGORITHM,
};
use seckernel::store::{DurableStore, SqliteStore};
use seckernel::config::KernelConfig;
use seckernel::{SecurityKernel, SecurityLabel};
use tokio::sync::watch;

fn lifecycle(interval_secs: u64) -> Arc<KeyLifecycle> {
    Arc::new(KeyLifecycle::new(
        Arc::new(InMemoryKeyring::new([31u8; 32])),
        Arc::new(NullSink),
        RotationConfig {
            interval: Duration::from_secs(interval_secs),
            jitter_fraction: 0.0,
            retry_backoff: Duration::from_secs(1),
            history_limit: 10,
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn emergency_rotation_restarts_the_schedule() {
    let lifecycle = lifecycle(10);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(Arc::clone(&lifecycle).run_scheduler(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(6)).await;
    let entry = lifecycle.emergency_rotation("breach").await.expect("rotate");
    assert!(entry.emergency);
    assert_eq!(lifecycle.active_version(), 2);

    // The original deadline (t=10) has passed without a scheduled rotation.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(lifecycle.active_version(), 2);

    // The restarted timer fires at t=16.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(lifecycle.active_version(), 3);

    shutdown_tx.send(true).expect("send shutdown");
    scheduler.await.expect("scheduler exits");
}

#[tokio::test]
async fn rotation_history_persists_to_sqlite() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("kernel.db");
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&path).await.expect("open"));

    let first = lifecycle(3600);
    first.attach_store(Arc::clone(&store)).await.expect("attach");
    first.rotate_keys("one").await.expect("rotate");
    first.emergency_rotation("two").await.expect("rotate");
    assert_eq!(store.list(KEY_HISTORY_STORE).await.expect("list").len(), 2);

    let reopened: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&path).await.expect("reopen"));
    let second = lifecycle(3600);
    second.attach_store(reopened).await.expect("attach");
    assert_eq!(second.active_version(), 3);
    let history = second.history();
    assert_eq!(history.len(), 2);
    assert!(history.last().is_some_and(|e| e.emergency));
}

#[tokio::test]
async fn action_signatures_verify_and_reject_tampering() {
    let kernel = SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([32u8; 32])),
        None,
    )
    .expect("kernel");
    let label = SecurityLabel::new("secret", ["NATO"]);
    let signature = kernel
        .sign_action("officer", "release", &label)
        .await
        .expect("sign");

    let payload = ActionPayload {
        user_id: "officer".to_owned(),
        action: "release".to_owned(),
        label: label.clone(),
        timestamp: signature.timestamp,
    };
    let key = decode_verifying_key(&signature.public_key).expect("key");
    assert!(kernel.verify_signature(&signature, &payload, Some(&key)).await);
    assert!(kernel.verify_signature(&signature, &payload, None).await);

    let forged = ActionPayload {
        user_id: "intruder".to_owned(),
        ..payload
    };
    assert!(!kernel.verify_signature(&signature, &forged, Some(&key)).await);
}

#[tokio::test]
async fn signatures_from_outside_keys_are_rejected() {
    let kernel = SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([33u8; 32])),
        None,
    )
    .expect("kernel");
    let payload = ActionPayload {
        user_id: "officer".to_owned(),
        action: "release".to_owned(),
        label: SecurityLabel::new("secret", ["NATO"]),
        timestamp: Utc::now(),
    };
    let message = payload.canonical().expect("canonical");

    let attacker = SigningKey::from_bytes(&[0xAA; 32]);
    let minted = ActionSignature {
        signature: STANDARD.encode(attacker.sign(&message).to_bytes()),
        algorithm: SIGNATURE_ALGORITHM.to_owned(),
        timestamp: payload.timestamp,
        public_key: STANDARD.encode(attacker.verifying_key().to_bytes()),
    };
    assert!(!kernel.verify_signature(&minted, &payload, None).await);

    // A genuine signature from another deployment's keyring.
    let other = SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([34u8; 32])),
        None,
    )
    .expect("kernel");
    let foreign = other
        .sign_action("officer", "release", &payload.label)
        .await
        .expect("sign");
    let foreign_payload = ActionPayload {
        timestamp: foreign.timestamp,
        ..payload
    };
    assert!(other.verify_signature(&foreign, &foreign_payload, None).await);
    assert!(!kernel.verify_signature(&foreign, &foreign_payload, None).await);
}
