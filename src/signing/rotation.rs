//! Envelope key lifecycle: versioning, rotation and the rotation scheduler.
//!
//! The active key version starts at 1 and only ever increases. Old versions
//! stay derivable through the keyring, so envelopes sealed before a rotation
//! remain readable. A rotation first proves the keyring can produce the next
//! version (via a canary domain) and changes nothing if it cannot.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::audit::event::{AuditEvent, AuditEventType};
use crate::audit::sink::AuditSink;
use crate::crypto::keyring::{Keyring, KeyringError};
use crate::store::DurableStore;

/// Durable store holding rotation history.
pub const KEY_HISTORY_STORE: &str = "key_history";

/// Domain checked for keyring health before every rotation.
pub const CANARY_DOMAIN: &str = "rotation::canary";

/// Rotation error types.
#[derive(Debug, Error)]
pub enum RotationError {
    /// The keyring could not produce the next key version.
    #[error("key version {version} unavailable: {source}")]
    KeyUnavailable {
        /// Version that was requested.
        version: u32,
        /// Keyring failure.
        #[source]
        source: KeyringError,
    },
    /// The version counter cannot advance further.
    #[error("key version space exhausted")]
    VersionExhausted,
}

/// One completed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHistoryEntry {
    /// When the rotation took effect.
    pub rotated_at: DateTime<Utc>,
    /// Version active before.
    pub from_version: u32,
    /// Version active after.
    pub to_version: u32,
    /// Why the rotation happened.
    pub reason: String,
    /// Whether this was an emergency rotation.
    pub emergency: bool,
}

/// Observer notified after every rotation.
pub trait RotationListener: Send + Sync {
    /// Called once per completed rotation.
    fn on_rotation(&self, entry: &KeyHistoryEntry);
}

/// Rotation timing and retention.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Base interval between scheduled rotations.
    pub interval: Duration,
    /// Upper bound of random jitter as a fraction of `interval`, in `[0, 1]`.
    pub jitter_fraction: f64,
    /// Delay before retrying a failed scheduled rotation.
    pub retry_backoff: Duration,
    /// History entries retained in memory.
    pub history_limit: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            jitter_fraction: 0.1,
            retry_backoff: Duration::from_secs(5 * 60),
            history_limit: 100,
        }
    }
}

/// Owns the active envelope key version.
pub struct KeyLifecycle {
    keyring: Arc<dyn Keyring>,
    sink: Arc<dyn AuditSink>,
    config: RotationConfig,
    version: AtomicU32,
    history: Mutex<VecDeque<KeyHistoryEntry>>,
    rotate_lock: tokio::sync::Mutex<()>,
    listeners: StdRwLock<Vec<Arc<dyn RotationListener>>>,
    reschedule: Notify,
    store: RwLock<Option<Arc<dyn DurableStore>>>,
}

impl std::fmt::Debug for KeyLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLifecycle")
            .field("active_version", &self.active_version())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KeyLifecycle {
    /// Create a lifecycle at version 1.
    pub fn new(keyring: Arc<dyn Keyring>, sink: Arc<dyn AuditSink>, config: RotationConfig) -> Self {
        Self {
            keyring,
            sink,
            config,
            version: AtomicU32::new(1),
            history: Mutex::new(VecDeque::new()),
            rotate_lock: tokio::sync::Mutex::new(()),
            listeners: StdRwLock::new(Vec::new()),
            reschedule: Notify::new(),
            store: RwLock::new(None),
        }
    }

    /// Currently active key version.
    pub fn active_version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Retained rotation history, oldest first.
    pub fn history(&self) -> Vec<KeyHistoryEntry> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a rotation listener.
    pub fn add_listener(&self, listener: Arc<dyn RotationListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Persist future rotations to `store` and resume from its history.
    ///
    /// The active version advances to the highest persisted `to_version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored history cannot be read.
    pub async fn attach_store(
        &self,
        store: Arc<dyn DurableStore>,
    ) -> Result<(), crate::store::StoreError> {
        let _guard = self.rotate_lock.lock().await;
        let records = store.list(KEY_HISTORY_STORE).await?;
        let mut restored = Vec::with_capacity(records.len());
        for (key, value) in records {
            match serde_json::from_value::<KeyHistoryEntry>(value) {
                Ok(entry) => restored.push(entry),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable key history record"),
            }
        }
        if let Some(latest) = restored.iter().map(|e| e.to_version).max() {
            self.version.fetch_max(latest, Ordering::SeqCst);
        }
        if let Ok(mut history) = self.history.lock() {
            for entry in restored {
                if !history.iter().any(|h| h.to_version == entry.to_version) {
                    history.push_back(entry);
                }
            }
            history.make_contiguous().sort_by_key(|e| e.to_version);
            self.trim(&mut history);
        }
        *self.store.write().await = Some(store);
        debug!(active_version = self.active_version(), "key history attached");
        Ok(())
    }

    /// Rotate to the next key version.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::KeyUnavailable`] with no state change when
    /// the keyring cannot produce the next version.
    pub async fn rotate_keys(&self, reason: &str) -> Result<KeyHistoryEntry, RotationError> {
        self.rotate(reason, false).await
    }

    /// Cancel the pending scheduled rotation and rotate immediately.
    ///
    /// # Errors
    ///
    /// Same as [`KeyLifecycle::rotate_keys`].
    pub async fn emergency_rotation(&self, reason: &str) -> Result<KeyHistoryEntry, RotationError> {
        self.reschedule.notify_one();
        warn!(reason, "emergency key rotation requested");
        self.rotate(reason, true).await
    }

    /// Clear retained history.
    pub fn destroy(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    /// Delay until the next scheduled rotation.
    ///
    /// `interval` plus uniform jitter in `[0, jitter_fraction * interval)`.
    pub fn next_delay(&self) -> Duration {
        let fraction = if self.config.jitter_fraction.is_finite() {
            self.config.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if fraction <= 0.0 {
            return self.config.interval;
        }
        let jitter = rand::thread_rng().gen_range(0.0..fraction);
        self.config
            .interval
            .saturating_add(self.config.interval.mul_f64(jitter))
    }

    /// Run scheduled rotations until `shutdown_rx` flips to `true`.
    ///
    /// An emergency rotation restarts the timer. A failed rotation is
    /// retried after `retry_backoff`.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut delay = self.next_delay();
        info!(delay_secs = delay.as_secs(), "key rotation scheduler started");
        loop {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    delay = match self.rotate_keys("scheduled").await {
                        Ok(_) => self.next_delay(),
                        Err(e) => {
                            error!(error = %e, "scheduled key rotation failed");
                            self.config.retry_backoff
                        }
                    };
                }
                () = self.reschedule.notified() => {
                    delay = self.next_delay();
                    debug!(delay_secs = delay.as_secs(), "rotation timer restarted");
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("key rotation scheduler stopped");
    }

    async fn rotate(&self, reason: &str, emergency: bool) -> Result<KeyHistoryEntry, RotationError> {
        let _guard = self.rotate_lock.lock().await;
        let from_version = self.active_version();
        let to_version = from_version
            .checked_add(1)
            .ok_or(RotationError::VersionExhausted)?;

        if let Err(source) = self.keyring.get_key(CANARY_DOMAIN, to_version).await {
            warn!(version = to_version, error = %source, "rotation aborted, next key unavailable");
            return Err(RotationError::KeyUnavailable {
                version: to_version,
                source,
            });
        }

        self.version.store(to_version, Ordering::SeqCst);
        let entry = KeyHistoryEntry {
            rotated_at: Utc::now(),
            from_version,
            to_version,
            reason: reason.to_owned(),
            emergency,
        };
        if let Ok(mut history) = self.history.lock() {
            history.push_back(entry.clone());
            self.trim(&mut history);
        }

        self.persist(&entry).await;
        self.sink.emit(AuditEvent::new(
            AuditEventType::KeyRotation,
            json!({
                "from_version": from_version,
                "to_version": to_version,
                "reason": reason,
                "emergency": emergency,
            }),
        ));
        self.notify_listeners(&entry);
        info!(from_version, to_version, emergency, "envelope keys rotated");
        Ok(entry)
    }

    async fn persist(&self, entry: &KeyHistoryEntry) {
        let Some(store) = self.store.read().await.clone() else {
            return;
        };
        let record = match serde_json::to_value(entry) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "key history entry not serializable");
                return;
            }
        };
        let key = format!("{:010}", entry.to_version);
        if let Err(e) = store.put(KEY_HISTORY_STORE, &key, &record).await {
            warn!(to_version = entry.to_version, error = %e, "failed to persist key history");
        }
    }

    fn notify_listeners(&self, entry: &KeyHistoryEntry) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_rotation(entry))).is_err() {
                warn!(to_version = entry.to_version, "rotation listener panicked");
            }
        }
    }

    fn trim(&self, history: &mut VecDeque<KeyHistoryEntry>) {
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}
