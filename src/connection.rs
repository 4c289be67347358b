//! Connection handle with a per-database handle cache
//!
//! The first `database(name)` call opens the database and provisions its
//! indexes. Concurrent first callers wait on the same initialization, so every
//! caller sees one instance and provisioning runs once per database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use crate::index::IndexProvisioner;
use crate::store::{connect_document, redact, ConnectOptions, DocumentConnection, DocumentDatabase};
use crate::{Error, Result};

/// Lifecycle of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

type DatabaseCell = Arc<OnceCell<Arc<dyn DocumentDatabase>>>;

pub struct ConnectionHandle {
    endpoint: String,
    connection: Arc<dyn DocumentConnection>,
    databases: Mutex<HashMap<String, DatabaseCell>>,
    provisioner: Arc<dyn IndexProvisioner>,
}

impl ConnectionHandle {
    /// Connect to `endpoint`. A failed attempt produces no handle.
    pub async fn connect(
        endpoint: &str,
        options: &ConnectOptions,
        provisioner: Arc<dyn IndexProvisioner>,
    ) -> Result<Self> {
        let shown = redact(endpoint);
        let mut state = ConnectionState::Disconnected;
        tracing::debug!(endpoint = %shown, ?state, "connecting");

        state = ConnectionState::Connecting;
        tracing::debug!(endpoint = %shown, ?state, "connecting");
        match connect_document(endpoint, options).await {
            Ok(connection) => {
                state = ConnectionState::Connected;
                tracing::info!(endpoint = %shown, ?state, "connected");
                Ok(Self::from_connection(connection, provisioner))
            }
            Err(e) => {
                state = ConnectionState::Failed;
                tracing::error!(endpoint = %shown, ?state, "connection failed: {}", e);
                Err(match e {
                    Error::Connection(_) | Error::Unsupported(_) => e,
                    other => Error::Connection(other.to_string()),
                })
            }
        }
    }

    /// Wrap an already open connection
    pub fn from_connection(
        connection: Arc<dyn DocumentConnection>,
        provisioner: Arc<dyn IndexProvisioner>,
    ) -> Self {
        Self {
            endpoint: connection.endpoint().to_string(),
            connection,
            databases: Mutex::new(HashMap::new()),
            provisioner,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cached handle for `name`, opening and provisioning it on first use
    pub async fn database(&self, name: &str) -> Result<Arc<dyn DocumentDatabase>> {
        let cell = {
            let mut databases = self
                .databases
                .lock()
                .map_err(|_| Error::Connection("database cache mutex poisoned".to_string()))?;
            databases.entry(name.to_string()).or_default().clone()
        };

        if let Some(database) = cell.get() {
            tracing::debug!(database = name, "database cache hit");
            return Ok(database.clone());
        }

        let opened = cell
            .get_or_try_init(|| async {
                tracing::debug!(endpoint = %redact(&self.endpoint), database = name, "opening database");
                let database = self.connection.open_database(name).await?;
                let report = self.provisioner.provision(database.as_ref()).await;
                if !report.is_clean() {
                    tracing::warn!(
                        database = name,
                        failed = report.failed.len(),
                        "database opened with missing indexes"
                    );
                }
                Ok::<_, Error>(database)
            })
            .await;

        match opened {
            Ok(database) => Ok(database.clone()),
            Err(e) => {
                self.evict_empty(name, &cell);
                Err(e)
            }
        }
    }

    /// Forget a cell whose open failed, unless another caller still waits on it.
    /// New clones are only taken under the map lock, so a count of two (map plus
    /// `cell`) means nobody else can initialize it.
    fn evict_empty(&self, name: &str, cell: &DatabaseCell) {
        let Ok(mut databases) = self.databases.lock() else {
            return;
        };
        let unused = databases.get(name).is_some_and(|cached| {
            Arc::ptr_eq(cached, cell) && !cell.initialized() && Arc::strong_count(cell) == 2
        });
        if unused {
            databases.remove(name);
        }
    }

    /// Names of databases opened so far, sorted
    pub fn cached_databases(&self) -> Vec<String> {
        let Ok(databases) = self.databases.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = databases
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &redact(&self.endpoint))
            .field("databases", &self.cached_databases())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use async_trait::async_trait;
    use crate::index::provisioner::ProvisionReport;
    use crate::index::{CatalogProvisioner, IndexCatalog};
    use crate::store::SqliteConnection;

    /// Counts passes and stalls so that concurrent callers overlap
    #[derive(Default)]
    struct CountingProvisioner {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl IndexProvisioner for CountingProvisioner {
        async fn provision(&self, _database: &dyn DocumentDatabase) -> ProvisionReport {
            self.passes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            ProvisionReport::default()
        }
    }

    /// Fails the first open, then delegates
    struct FlakyConnection {
        inner: SqliteConnection,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DocumentConnection for FlakyConnection {
        fn endpoint(&self) -> &str {
            "flaky"
        }

        async fn open_database(&self, name: &str) -> Result<Arc<dyn DocumentDatabase>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Connection("transient".to_string()));
            }
            self.inner.open_database(name).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_is_single_flight() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let handle = Arc::new(ConnectionHandle::from_connection(
            Arc::new(SqliteConnection::in_memory()),
            provisioner.clone(),
        ));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.database("game").await.unwrap() })
            })
            .collect();
        let mut databases = Vec::new();
        for task in tasks {
            databases.push(task.await.unwrap());
        }

        assert_eq!(provisioner.passes.load(Ordering::SeqCst), 1);
        assert!(databases.iter().all(|db| Arc::ptr_eq(db, &databases[0])));
        assert_eq!(handle.cached_databases(), vec!["game"]);
    }

    #[tokio::test]
    async fn test_distinct_names_get_distinct_databases() {
        let provisioner = Arc::new(CountingProvisioner::default());
        let handle = ConnectionHandle::from_connection(Arc::new(SqliteConnection::in_memory()), provisioner.clone());

        let a = handle.database("a").await.unwrap();
        let b = handle.database("b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &handle.database("a").await.unwrap()));
        assert_eq!(provisioner.passes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_failure_does_not_poison_cache() {
        let handle = ConnectionHandle::from_connection(
            Arc::new(FlakyConnection {
                inner: SqliteConnection::in_memory(),
                attempts: AtomicUsize::new(0),
            }),
            Arc::new(CountingProvisioner::default()),
        );

        assert!(matches!(handle.database("game").await, Err(Error::Connection(_))));
        assert!(handle.cached_databases().is_empty());
        assert!(handle.database("game").await.is_ok());
        assert_eq!(handle.cached_databases(), vec!["game"]);
    }

    #[tokio::test]
    async fn test_failed_opens_leave_no_cache_entries() {
        let handle = ConnectionHandle::from_connection(
            Arc::new(SqliteConnection::in_memory()),
            Arc::new(CountingProvisioner::default()),
        );

        for i in 0..50 {
            let name = format!("bad name {}", i);
            assert!(matches!(handle.database(&name).await, Err(Error::InvalidName(_))));
        }
        assert!(handle.databases.lock().unwrap().is_empty());

        handle.database("game").await.unwrap();
        assert_eq!(handle.databases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_access_provisions_catalog_indexes() {
        let handle = ConnectionHandle::connect(
            "sqlite::memory:",
            &ConnectOptions::default(),
            Arc::new(CatalogProvisioner::new(IndexCatalog::builtin())),
        )
        .await
        .unwrap();

        let db = handle.database("adjust").await.unwrap();
        assert_eq!(db.list_indexes("install").await.unwrap(), vec!["_id_", "adid_1", "app_id_1"]);
    }

    #[tokio::test]
    async fn test_connect_failure_yields_no_handle() {
        let result = ConnectionHandle::connect(
            "sqlite://",
            &ConnectOptions::default(),
            Arc::new(CountingProvisioner::default()),
        )
        .await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }
}
