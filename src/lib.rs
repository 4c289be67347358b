//! # Tenantdb - Multi-tenant data access layer
//!
//! Routes tenant-scoped operations to pre-connected document and key-value stores.
//!
//! Tenantdb provides:
//! - A client registry mapping tenant keys to connections, with pluggable resolution
//! - Lazily opened, single-flight cached database handles with one-time index provisioning
//! - A typed result materializer that drains streamed cursors into caller containers
//! - A cooperative TTL-bounded spin lock on the key-value store
//! - SQLite backends out of the box, MongoDB and Redis behind cargo features

pub mod config;
pub mod registry;
pub mod connection;
pub mod index;
pub mod document;
pub mod materialize;
pub mod mutex;
pub mod metrics;
pub mod store;
pub mod tenant;
pub mod bootstrap;
pub mod ui;

// Re-exports for convenient access
pub use registry::{ClientRegistry, ResolveStrategy, ExactOrDefault, ShardByHash};
pub use connection::{ConnectionHandle, ConnectionState};
pub use index::{IndexSpec, IndexOrder, IndexCatalog, IndexProvisioner, CatalogProvisioner};
pub use document::{Filter, Update, FindOptions, SortOrder, UpdateResult, WriteModel, BulkWriteResult};
pub use materialize::{check_container, drain_all, drain_first, drain_json, FindMode};
pub use mutex::{DistributedMutex, RetryPolicy, Backoff};
pub use metrics::{MetricsSink, OperationSample, Outcome};
pub use store::{DocumentConnection, DocumentDatabase, DocumentCursor, KeyValueStore};
pub use tenant::{TenantStore, Collection};

/// Result type alias for Tenantdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Tenantdb operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No client configured for tenant '{0}'")]
    NoClientConfigured(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to create index {index} on {database}: {reason}")]
    IndexProvision {
        database: String,
        index: String,
        reason: String,
    },

    #[error("Conflicting index definition: {0}")]
    IndexConflict(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "mongo")]
    #[error("BSON error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl Error {
    /// Whether a caller may reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "mongo")]
            Self::Mongo(e) => matches!(
                *e.kind,
                mongodb::error::ErrorKind::Io(_)
                    | mongodb::error::ErrorKind::ServerSelection { .. }
                    | mongodb::error::ErrorKind::ConnectionPoolCleared { .. }
            ),
            #[cfg(feature = "redis")]
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}
