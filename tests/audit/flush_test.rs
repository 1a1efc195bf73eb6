//! Buffered flushing against unreliable storage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use seckernel::audit::chain::{AuditChain, AUDIT_STORE};
use seckernel::audit::sanitize::SanitizeLimits;
use seckernel::audit::{AuditEvent, AuditEventType};
use seckernel::policy::{AuditPolicy, Environment, PolicyValue, StaticPolicy, KEY_ALLOW_UNSIGNED_AUDIT};
use seckernel::store::{DurableStore, MemoryStore, StoreError};
use serde_json::{json, Value};

/// Fails every put after `fail_after` successful ones while `failing` is set.
struct FlakyStore {
    inner: MemoryStore,
    puts: AtomicUsize,
    fail_after: usize,
    failing: AtomicBool,
}

impl FlakyStore {
    fn new(fail_after: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            puts: AtomicUsize::new(0),
            fail_after,
            failing: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) && self.puts.load(Ordering::SeqCst) >= self.fail_after {
            return Err(StoreError::Unavailable("disk detached".to_owned()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(store, key, record).await
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(store, key).await
    }

    async fn list(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.inner.list(store).await
    }
}

fn unsigned_chain(capacity: usize) -> AuditChain {
    let source = StaticPolicy::new().with(KEY_ALLOW_UNSIGNED_AUDIT, PolicyValue::Bool(true));
    AuditChain::new(
        capacity,
        None,
        AuditPolicy::resolve(Some(&source), Environment::Development),
        SanitizeLimits::default(),
    )
}

async fn commit(chain: &AuditChain, n: u64) {
    chain
        .log_event(AuditEvent::new(AuditEventType::MacDecision, json!({ "n": n })))
        .await
        .expect("commit");
}

#[tokio::test]
async fn failed_flush_requeues_in_order_and_retry_completes() {
    let chain = unsigned_chain(64);
    for n in 1..=5 {
        commit(&chain, n).await;
    }
    let store = Arc::new(FlakyStore::new(2));
    chain.attach_store(store.clone()).await.expect("attach");

    assert!(chain.flush().await.is_err());
    assert_eq!(chain.buffered(), 3);

    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(chain.flush().await.expect("retry"), 3);
    assert_eq!(chain.buffered(), 0);

    let ids: Vec<u64> = store
        .list(AUDIT_STORE)
        .await
        .expect("list")
        .into_iter()
        .filter_map(|(_, v)| v["id"].as_u64())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(chain.verify_chain().await.expect("verify").valid);
}

#[tokio::test]
async fn events_committed_during_outage_keep_their_order() {
    let chain = unsigned_chain(64);
    let store = Arc::new(FlakyStore::new(0));
    chain.attach_store(store.clone()).await.expect("attach");

    commit(&chain, 1).await;
    assert!(chain.flush().await.is_err());
    commit(&chain, 2).await;
    assert_eq!(chain.buffered(), 2);

    store.failing.store(false, Ordering::SeqCst);
    assert_eq!(chain.flush().await.expect("flush"), 2);
    let payloads: Vec<Value> = store
        .list(AUDIT_STORE)
        .await
        .expect("list")
        .into_iter()
        .map(|(_, v)| v["payload"]["n"].clone())
        .collect();
    assert_eq!(payloads, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn concurrent_flushes_write_each_envelope_once() {
    let chain = Arc::new(unsigned_chain(256));
    let store = Arc::new(MemoryStore::new());
    chain.attach_store(store.clone()).await.expect("attach");

    let mut producers = Vec::new();
    for worker in 0..4u64 {
        let chain = Arc::clone(&chain);
        producers.push(tokio::spawn(async move {
            for n in 0..25u64 {
                commit(&chain, worker * 100 + n).await;
                chain.flush().await.expect("flush");
            }
        }));
    }
    for producer in producers {
        producer.await.expect("producer");
    }
    chain.flush().await.expect("final flush");

    assert_eq!(store.list(AUDIT_STORE).await.expect("list").len(), 100);
    let verification = chain.verify_chain().await.expect("verify");
    assert!(verification.valid);
    assert_eq!(verification.checked, 100);
}
