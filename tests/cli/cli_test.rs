//! CLI contract tests.

use std::sync::Arc;

use assert_cmd::Command;
use seckernel::audit::chain::{AuditChain, AuditEnvelope, AUDIT_STORE};
use seckernel::audit::sanitize::{digest, SanitizeLimits};
use seckernel::audit::sink::NullSink;
use seckernel::audit::{AuditEvent, AuditEventType};
use seckernel::crypto::domain::DomainCache;
use seckernel::crypto::InMemoryKeyring;
use seckernel::policy::AuditPolicy;
use seckernel::signing::signer::AUDIT_SIGNING_DOMAIN;
use seckernel::signing::NonRepudiationSigner;
use seckernel::store::{DurableStore, SqliteStore};
use serde_json::json;

fn seckernel() -> Command {
    let mut cmd = Command::cargo_bin("seckernel").expect("binary builds");
    cmd.env("HOME", env!("CARGO_TARGET_TMPDIR"));
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("runs");
    String::from_utf8(output.stdout).expect("utf8")
}

#[test]
fn check_reports_read_decisions() {
    seckernel()
        .args(["check", "secret:NATO", "confidential"])
        .assert()
        .success();
    seckernel()
        .args(["check", "secret:NATO", "top_secret"])
        .assert()
        .failure();
    let out = stdout_of(seckernel().args(["check", "secret:NATO", "confidential"]));
    assert!(out.contains("\"allowed\":true"));
}

#[test]
fn check_reports_write_decisions() {
    seckernel()
        .args(["check", "--op", "write", "confidential", "secret:NATO"])
        .assert()
        .success();
    seckernel()
        .args(["check", "--op", "write", "confidential", "public"])
        .assert()
        .failure();
}

#[test]
fn domain_is_order_independent() {
    let a = stdout_of(seckernel().args(["domain", "SECRET:beta,alpha"]));
    let b = stdout_of(seckernel().args(["domain", "secret:alpha,beta"]));
    assert_eq!(a.trim(), "secret::alpha,beta");
    assert_eq!(a, b);
}

#[test]
fn hint_is_stable_for_a_day() {
    let hint = stdout_of(seckernel().args(["hint", "secret:x", "--date", "2026-03-01"]));
    assert_eq!(hint.trim().len(), 16);
    assert!(hint.trim().chars().all(|c| c.is_ascii_hexdigit()));
    let again = stdout_of(seckernel().args(["hint", "secret:x", "--date", "2026-03-01"]));
    assert_eq!(hint, again);
    seckernel().args(["hint", "cosmic"]).assert().failure();
}

#[test]
fn derive_flags_write_down() {
    seckernel()
        .args(["derive", "--source", "secret", "--derived", "confidential"])
        .assert()
        .failure();
    seckernel()
        .args(["derive", "--source", "secret", "--source", "internal:ops", "--derived", "secret:ops"])
        .assert()
        .success();
}

#[test]
fn custom_lattice_from_config() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = tmp.path().join("seckernel.toml");
    std::fs::write(&config, "[lattice]\nlevels = [\"low\", \"high\"]\n").expect("write config");
    seckernel()
        .arg("--config")
        .arg(&config)
        .args(["check", "high", "low"])
        .assert()
        .success();
    seckernel()
        .arg("--config")
        .arg(&config)
        .args(["check", "secret", "public"])
        .assert()
        .failure();
}

/// Persist a three-envelope signed chain and return the audit signing key.
fn signed_database(path: &std::path::Path) -> String {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let store = Arc::new(SqliteStore::open(path).await.expect("open"));
        let signer = Arc::new(NonRepudiationSigner::new(
            Arc::new(InMemoryKeyring::new([61u8; 32])),
            Arc::new(DomainCache::new(4)),
            Arc::new(NullSink),
        ));
        let chain = AuditChain::new(
            16,
            Some(Arc::clone(&signer)),
            AuditPolicy::default(),
            SanitizeLimits::default(),
        );
        chain.attach_store(store).await.expect("attach");
        for n in 0..3 {
            chain
                .log_event(AuditEvent::new(AuditEventType::Lineage, json!({ "n": n })))
                .await
                .expect("commit");
        }
        chain.flush().await.expect("flush");
        signer.public_key(AUDIT_SIGNING_DOMAIN).await.expect("audit key")
    })
}

/// Rewrite every envelope after the first as unsigned, keeping hashes consistent.
fn strip_signatures(path: &std::path::Path) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    rt.block_on(async {
        let store = SqliteStore::open(path).await.expect("open");
        let records = store.list(AUDIT_STORE).await.expect("list");
        let mut previous: Option<String> = None;
        for (key, record) in records {
            let mut envelope: AuditEnvelope = serde_json::from_value(record).expect("envelope");
            if let Some(previous) = &previous {
                envelope.payload = json!({ "n": "rewritten" });
                envelope.payload_hash = digest(&envelope.payload);
                envelope.previous_hash = previous.clone();
                envelope.signature = None;
                envelope.public_key = None;
                envelope.signed = false;
                let body = serde_json::to_string(&envelope).expect("encode");
                sqlx::query("UPDATE records SET body = ?1 WHERE store = ?2 AND key = ?3")
                    .bind(body)
                    .bind(AUDIT_STORE)
                    .bind(&key)
                    .execute(store.pool())
                    .await
                    .expect("rewrite");
            }
            previous = Some(envelope.envelope_hash());
        }
    });
}

#[test]
fn verify_audit_checks_a_database() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    let key = signed_database(&path);

    let out = stdout_of(
        seckernel()
            .arg("verify-audit")
            .arg("--db")
            .arg(&path)
            .args(["--public-key", key.as_str()]),
    );
    assert!(out.contains("\"valid\":true"));

    seckernel()
        .arg("verify-audit")
        .arg("--db")
        .arg(&path)
        .args(["--public-key", "bm90IHRoZSBrZXk="])
        .assert()
        .failure();

    seckernel()
        .arg("verify-audit")
        .arg("--db")
        .arg(tmp.path().join("missing.db"))
        .assert()
        .failure();
}

#[test]
fn verify_audit_never_trusts_embedded_keys() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    signed_database(&path);

    seckernel()
        .arg("verify-audit")
        .arg("--db")
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn verify_audit_flags_unsigned_rewrites() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("audit.db");
    let key = signed_database(&path);
    strip_signatures(&path);

    let out = stdout_of(
        seckernel()
            .arg("verify-audit")
            .arg("--db")
            .arg(&path)
            .args(["--public-key", key.as_str()]),
    );
    assert!(out.contains("\"broken_at\":2"));

    seckernel()
        .arg("verify-audit")
        .arg("--db")
        .arg(&path)
        .args(["--public-key", key.as_str(), "--allow-unsigned"])
        .assert()
        .success();
}

#[test]
fn start_requires_an_audit_database() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = tmp.path().join("seckernel.toml");
    std::fs::write(&config, "[rotation]\nenabled = false\n").expect("write config");
    let key = tmp.path().join("master.key");
    std::fs::write(&key, "11".repeat(32)).expect("write key");
    let logs = tmp.path().join("logs");

    seckernel()
        .arg("--config")
        .arg(&config)
        .arg("start")
        .arg("--master-key-file")
        .arg(&key)
        .arg("--logs-dir")
        .arg(&logs)
        .assert()
        .failure();
    assert!(logs.is_dir());
}

#[test]
fn start_rejects_a_malformed_master_key() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = tmp.path().join("seckernel.toml");
    std::fs::write(
        &config,
        format!("[audit]\ndb_path = {:?}\n", tmp.path().join("audit.db").display().to_string()),
    )
    .expect("write config");
    let key = tmp.path().join("master.key");
    std::fs::write(&key, "abcd").expect("write key");

    seckernel()
        .arg("--config")
        .arg(&config)
        .arg("start")
        .arg("--master-key-file")
        .arg(&key)
        .arg("--logs-dir")
        .arg(tmp.path().join("logs"))
        .assert()
        .failure();
    assert!(!tmp.path().join("audit.db").exists());
}
