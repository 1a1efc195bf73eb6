//! End-to-end audit persistence through the kernel and SQLite.

use std::sync::Arc;

use seckernel::audit::chain::{AuditEnvelope, AUDIT_STORE};
use seckernel::audit::sanitize::digest;
use seckernel::config::{parse_config, KernelConfig};
use seckernel::crypto::InMemoryKeyring;
use seckernel::store::{record_key, DurableStore, SqliteStore};
use seckernel::{SecurityKernel, SecurityLabel};
use serde_json::json;

fn config_with_db(path: &std::path::Path) -> KernelConfig {
    let text = format!(
        "[audit]\ndb_path = {:?}\nflush_interval_secs = 1\n\n[rotation]\nenabled = false\n",
        path.display().to_string()
    );
    parse_config(&text).expect("config")
}

#[tokio::test]
async fn kernel_persists_a_verifiable_chain() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    let keyring = Arc::new(InMemoryKeyring::new([51u8; 32]));

    let kernel = SecurityKernel::open(config_with_db(&path), keyring.clone(), None)
        .await
        .expect("open");
    kernel.start();
    kernel.login("alice", SecurityLabel::new("secret", ["NATO"]));
    assert!(kernel.enforce_read(&SecurityLabel::level("confidential")).is_ok());
    assert!(kernel.enforce_read(&SecurityLabel::level("top_secret")).is_err());
    assert!(kernel
        .derived(&[SecurityLabel::level("secret")], &SecurityLabel::level("internal"), json!({}))
        .is_err());
    kernel.shutdown().await;

    let verification = kernel.verify_chain().await.expect("verify");
    assert!(verification.valid);
    assert!(verification.checked >= 4);

    // A fresh kernel over the same database continues the chain.
    let reopened = SecurityKernel::open(config_with_db(&path), keyring, None)
        .await
        .expect("reopen");
    reopened.start();
    reopened.logout();
    reopened.shutdown().await;
    let resumed = reopened.verify_chain().await.expect("verify");
    assert!(resumed.valid);
    assert!(resumed.checked > verification.checked);
}

#[tokio::test]
async fn tampering_with_a_stored_row_is_detected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    let kernel = SecurityKernel::open(
        config_with_db(&path),
        Arc::new(InMemoryKeyring::new([52u8; 32])),
        None,
    )
    .await
    .expect("open");
    kernel.start();
    for _ in 0..3 {
        kernel.can_write(&SecurityLabel::level("public"), &SecurityLabel::level("secret"));
    }
    kernel.destroy_keys();
    kernel.shutdown().await;

    let store = SqliteStore::open(&path).await.expect("open store");
    let key = record_key(2);
    let mut record = store
        .get(AUDIT_STORE, &key)
        .await
        .expect("get")
        .expect("record 2 exists");
    record["payload"] = json!({"forged": true});
    sqlx::query("UPDATE records SET body = ?1 WHERE store = ?2 AND key = ?3")
        .bind(record.to_string())
        .bind(AUDIT_STORE)
        .bind(&key)
        .execute(store.pool())
        .await
        .expect("tamper");

    let verification = kernel.verify_chain().await.expect("verify");
    assert!(!verification.valid);
    assert_eq!(verification.broken_at, Some(2));
}

#[tokio::test]
async fn unsigned_rewrite_of_stored_rows_is_detected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    let kernel = SecurityKernel::open(
        config_with_db(&path),
        Arc::new(InMemoryKeyring::new([53u8; 32])),
        None,
    )
    .await
    .expect("open");
    kernel.start();
    for _ in 0..4 {
        kernel.can_write(&SecurityLabel::level("public"), &SecurityLabel::level("secret"));
    }
    kernel.shutdown().await;

    // Strip signatures from row 2 onward and re-link so every hash agrees.
    let store = SqliteStore::open(&path).await.expect("open store");
    let mut previous: Option<String> = None;
    for (key, record) in store.list(AUDIT_STORE).await.expect("list") {
        let mut envelope: AuditEnvelope = serde_json::from_value(record).expect("envelope");
        if let Some(previous) = &previous {
            envelope.payload = json!({ "rewritten": true });
            envelope.payload_hash = digest(&envelope.payload);
            envelope.previous_hash = previous.clone();
            envelope.signature = None;
            envelope.public_key = None;
            envelope.signed = false;
            sqlx::query("UPDATE records SET body = ?1 WHERE store = ?2 AND key = ?3")
                .bind(serde_json::to_string(&envelope).expect("encode"))
                .bind(AUDIT_STORE)
                .bind(&key)
                .execute(store.pool())
                .await
                .expect("rewrite");
        }
        previous = Some(envelope.envelope_hash());
    }

    let verification = kernel.verify_chain().await.expect("verify");
    assert!(!verification.valid);
    assert_eq!(verification.broken_at, Some(2));
}
