//! Storage seam - the narrow interfaces every backend implements
//!
//! Backends are selected by endpoint scheme:
//! - `sqlite::memory:` / `sqlite://<path>` - always available
//! - `mongodb://` / `mongodb+srv://` - cargo feature `mongo`
//! - `redis://` / `rediss://` - cargo feature `redis`

pub mod schema;
pub mod sqlite;
pub mod sqlite_kv;
#[cfg(feature = "mongo")]
pub mod mongo;
#[cfg(feature = "redis")]
pub mod redis_kv;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use crate::document::{BulkWriteResult, Filter, FindOptions, Update, UpdateResult, UpdateScope, WriteModel};
use crate::index::IndexSpec;
use crate::{Error, Result};

pub use sqlite::{SqliteConnection, SqliteDatabase};
pub use sqlite_kv::SqliteKv;

/// One live connection to a document store instance
#[async_trait]
pub trait DocumentConnection: Send + Sync {
    /// Endpoint this connection was opened against
    fn endpoint(&self) -> &str;

    /// Open a logical database. Callers cache the result.
    async fn open_database(&self, name: &str) -> Result<Arc<dyn DocumentDatabase>>;
}

/// A logical database within a connection
#[async_trait]
pub trait DocumentDatabase: Send + Sync {
    fn name(&self) -> &str;

    /// Short backend label used in metrics
    fn backend(&self) -> &'static str;

    /// Create the index if missing; returns its name
    async fn create_index(&self, spec: &IndexSpec) -> Result<String>;

    /// Index names on a collection, sorted
    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Box<dyn DocumentCursor>>;

    /// Insert one document; returns its `_id`
    async fn insert_one(&self, collection: &str, document: Value) -> Result<Value>;

    /// Insert documents in order; returns their `_id`s
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>>;

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: UpdateScope,
    ) -> Result<UpdateResult>;

    /// Update the first match and return it, before or after the change
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        return_updated: bool,
    ) -> Result<Option<Value>>;

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> Result<Option<Value>>;

    /// Delete the first match, or all matches when `many`; returns the count
    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> Result<u64>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Run an aggregation pipeline of Mongo-style stage documents
    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Box<dyn DocumentCursor>>;

    /// Apply `models` in order, stopping at the first failure. Writes made
    /// before the failure stay applied; backends with transactions override
    /// this to make the batch all or nothing.
    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        for (position, model) in models.into_iter().enumerate() {
            match model {
                WriteModel::InsertOne(document) => {
                    let id = self.insert_one(collection, document).await?;
                    result.inserted += 1;
                    result.inserted_ids.insert(position, id);
                }
                WriteModel::UpdateOne { filter, update, upsert } => {
                    let scope = if upsert { UpdateScope::Upsert } else { UpdateScope::One };
                    let updated = self.update(collection, &filter, &update, scope).await?;
                    result.add_update(position, updated);
                }
                WriteModel::UpdateMany { filter, update } => {
                    let updated = self.update(collection, &filter, &update, UpdateScope::Many).await?;
                    result.add_update(position, updated);
                }
                WriteModel::DeleteOne(filter) => result.deleted += self.delete(collection, &filter, false).await?,
                WriteModel::DeleteMany(filter) => result.deleted += self.delete(collection, &filter, true).await?,
            }
        }
        Ok(result)
    }

    /// Remove documents past their TTL index expiry. Stores that expire
    /// documents on their own report zero.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Lazy, forward-only, finite stream of documents
#[async_trait]
pub trait DocumentCursor: Send {
    /// Next document, or `None` once exhausted
    async fn next(&mut self) -> Result<Option<Value>>;

    /// Release the server-side resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Key-value store used for locks and small shared state
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn endpoint(&self) -> &str;

    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically store `value` only if `key` is absent; true when stored
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key; true when it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Non-blocking delete where the store has one
    async fn unlink(&self, key: &str) -> Result<bool> {
        self.delete(key).await
    }

    /// Delete `key` only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Reset the TTL of an existing key; false when the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Connection settings that are not part of the endpoint string
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// CA bundle for TLS connections
    pub ca_file: Option<PathBuf>,
    /// Upper bound on pooled connections
    pub pool_size: Option<u32>,
    pub connect_timeout: Option<Duration>,
}

/// Connect to a document store, choosing the backend by scheme
#[cfg_attr(not(feature = "mongo"), allow(unused_variables))]
pub async fn connect_document(
    endpoint: &str,
    options: &ConnectOptions,
) -> Result<Arc<dyn DocumentConnection>> {
    if endpoint.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteConnection::open(endpoint)?));
    }
    if endpoint.starts_with("mongodb://") || endpoint.starts_with("mongodb+srv://") {
        #[cfg(feature = "mongo")]
        return Ok(Arc::new(mongo::MongoConnection::connect(endpoint, options).await?));
        #[cfg(not(feature = "mongo"))]
        return Err(Error::Unsupported("mongodb endpoints need the `mongo` feature".to_string()));
    }
    Err(Error::Unsupported(format!(
        "unknown document endpoint scheme '{}'",
        redact(endpoint)
    )))
}

/// Connect to a key-value store, choosing the backend by scheme
#[cfg_attr(not(feature = "redis"), allow(unused_variables))]
pub async fn connect_kv(endpoint: &str, options: &ConnectOptions) -> Result<Arc<dyn KeyValueStore>> {
    if endpoint.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteKv::open(endpoint)?));
    }
    if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        return Ok(Arc::new(redis_kv::RedisKv::connect(endpoint, options).await?));
        #[cfg(not(feature = "redis"))]
        return Err(Error::Unsupported("redis endpoints need the `redis` feature".to_string()));
    }
    Err(Error::Unsupported(format!(
        "unknown key-value endpoint scheme '{}'",
        redact(endpoint)
    )))
}

/// Strip credentials from an endpoint before it is logged
pub fn redact(endpoint: &str) -> String {
    match (endpoint.find("://"), endpoint.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &endpoint[..scheme_end], &endpoint[at..])
        }
        _ => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact() {
        assert_eq!(redact("mongodb://user:pw@db:27017"), "mongodb://***@db:27017");
        assert_eq!(redact("redis://cache:6379"), "redis://cache:6379");
        assert_eq!(redact("sqlite::memory:"), "sqlite::memory:");
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_not_retryable() {
        for err in [
            connect_document("postgres://x", &ConnectOptions::default()).await.err().unwrap(),
            connect_kv("memcached://x", &ConnectOptions::default()).await.err().unwrap(),
        ] {
            assert!(matches!(err, Error::Unsupported(_)));
            assert!(!err.is_retryable());
        }
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_feature_gated_scheme() {
        let err = connect_kv("redis://localhost", &ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
