//! Envelope encryption across domains and key versions.

use std::sync::Arc;

use proptest::prelude::*;
use seckernel::config::KernelConfig;
use seckernel::crypto::domain::domain_of;
use seckernel::crypto::{CryptoError, InMemoryKeyring};
use seckernel::{SecurityKernel, SecurityLabel};
use serde_json::json;

fn kernel() -> SecurityKernel {
    SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([11u8; 32])),
        None,
    )
    .expect("kernel")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn domain_ignores_compartment_order(mut comps in prop::collection::vec("[a-zA-Z]{1,6}", 0..6)) {
        let forward = SecurityLabel::new("secret", comps.clone());
        comps.reverse();
        let backward = SecurityLabel::new("secret", comps);
        prop_assert_eq!(domain_of(&forward), domain_of(&backward));
    }

    #[test]
    fn distinct_compartment_sets_get_distinct_domains(
        a in prop::collection::btree_set(prop_oneof![Just("none".to_owned()), "[a-c,:%]{1,4}"], 0..4),
        b in prop::collection::btree_set(prop_oneof![Just("none".to_owned()), "[a-c,:%]{1,4}"], 0..4),
    ) {
        let left = domain_of(&SecurityLabel::new("secret", a.clone()));
        let right = domain_of(&SecurityLabel::new("secret", b.clone()));
        prop_assert_eq!(left == right, a == b);
    }

    #[test]
    fn decrypt_inverts_encrypt(payload in prop::collection::vec(any::<u8>(), 0..512), level in 0usize..5) {
        let rt = runtime();
        let kernel = kernel();
        let levels = ["public", "internal", "confidential", "secret", "top_secret"];
        let label = SecurityLabel::new(levels[level], ["alpha"]);
        let plain = rt.block_on(async {
            let envelope = kernel.encrypt(&label, &payload).await.expect("encrypt");
            kernel.decrypt(&label, &envelope).await.expect("decrypt")
        });
        prop_assert_eq!(plain, payload);
    }
}

#[tokio::test]
async fn compartment_order_shares_one_domain_key() {
    let kernel = kernel();
    let ab = SecurityLabel::new("secret", ["alpha", "beta"]);
    let ba = SecurityLabel::new("secret", ["beta", "alpha"]);
    let body = serde_json::to_vec(&json!({"a": 1})).expect("json");

    let first = kernel.encrypt(&ab, &body).await.expect("encrypt");
    let second = kernel.encrypt(&ba, &body).await.expect("encrypt");
    assert_eq!(first.domain, second.domain);

    assert_eq!(kernel.decrypt(&ba, &first).await.expect("decrypt"), body);
    assert_eq!(kernel.decrypt(&ab, &second).await.expect("decrypt"), body);
}

#[tokio::test]
async fn envelopes_survive_rotation_and_emergency_rotation() {
    let kernel = kernel();
    let label = SecurityLabel::level("top_secret");
    let v1 = kernel.encrypt(&label, b"one").await.expect("encrypt");
    kernel.rotate_keys("scheduled").await.expect("rotate");
    let v2 = kernel.encrypt(&label, b"two").await.expect("encrypt");
    kernel
        .emergency_rotation("suspected exposure")
        .await
        .expect("rotate");
    let v3 = kernel.encrypt(&label, b"three").await.expect("encrypt");

    assert_eq!((v1.key_version, v2.key_version, v3.key_version), (1, 2, 3));
    assert_eq!(kernel.decrypt(&label, &v1).await.expect("v1"), b"one");
    assert_eq!(kernel.decrypt(&label, &v2).await.expect("v2"), b"two");
    assert_eq!(kernel.decrypt(&label, &v3).await.expect("v3"), b"three");
}

#[tokio::test]
async fn foreign_keyring_cannot_open_envelopes() {
    let ours = kernel();
    let theirs = SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([12u8; 32])),
        None,
    )
    .expect("kernel");
    let label = SecurityLabel::level("secret");
    let envelope = ours.encrypt(&label, b"x").await.expect("encrypt");
    let err = theirs.cipher().decrypt(&label, &envelope).await.expect_err("wrong key");
    assert_eq!(err, CryptoError::DecryptionFailed);
}

#[tokio::test]
async fn destroyed_keyring_reports_key_unavailable() {
    let keyring = Arc::new(InMemoryKeyring::new([13u8; 32]));
    let kernel = SecurityKernel::new(KernelConfig::default(), keyring.clone(), None).expect("kernel");
    keyring.destroy().await;
    let err = kernel
        .cipher()
        .encrypt(&SecurityLabel::level("secret"), b"x")
        .await
        .expect_err("no key");
    assert!(matches!(err, CryptoError::KeyUnavailable { .. }));
}
