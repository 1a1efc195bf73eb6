//! Durable record storage.
//!
//! Records are JSON values addressed by `(store, key)`. Stores are
//! append-only: writing an existing key is a no-op, so retried flushes are
//! idempotent. [`SqliteStore`] applies its schema inline on open.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only keyed record storage.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write `record` under `key` unless the key already exists.
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError>;

    /// Read one record.
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// All records of `store` in ascending key order.
    async fn list(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

/// Zero-padded record key so lexical order matches numeric order.
pub fn record_key(id: u64) -> String {
    format!("{id:020}")
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    stores: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError> {
        let mut stores = self.stores.write().await;
        stores
            .entry(store.to_owned())
            .or_default()
            .entry(key.to_owned())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let stores = self.stores.read().await;
        Ok(stores.get(store).and_then(|s| s.get(key)).cloned())
    }

    async fn list(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let stores = self.stores.read().await;
        Ok(stores
            .get(store)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// SQLite-backed store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "failed to create store directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database, single connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let migration_sql = include_str!("../migrations/001_records.sql");
        sqlx::raw_sql(migration_sql).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        sqlx::query("INSERT OR IGNORE INTO records (store, key, body) VALUES (?1, ?2, ?3)")
            .bind(store)
            .bind(key)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE store = ?1 AND key = ?2")
                .bind(store)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, body FROM records WHERE store = ?1 ORDER BY key ASC")
                .bind(store)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(key, body)| Ok((key, serde_json::from_str(&body)?)))
            .collect()
    }
}
