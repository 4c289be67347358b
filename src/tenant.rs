//! Tenant-scoped access to collections
//!
//! `TenantStore` resolves the connection serving a tenant and hands out
//! `Collection` handles. By default the project key also names the database.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use crate::connection::ConnectionHandle;
use crate::document::{BulkWriteResult, Filter, FindOptions, Update, UpdateResult, UpdateScope, WriteModel};
use crate::materialize::{check_container, drain_all, drain_first, drain_json, FindMode};
use crate::metrics::{MetricsSink, OperationSample, Outcome, TracingMetrics};
use crate::registry::ClientRegistry;
use crate::store::DocumentDatabase;
use crate::Result;

pub struct TenantStore {
    documents: Arc<ClientRegistry<ConnectionHandle>>,
    metrics: Arc<dyn MetricsSink>,
}

impl TenantStore {
    pub fn new(documents: Arc<ClientRegistry<ConnectionHandle>>) -> Self {
        Self {
            documents,
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ClientRegistry<ConnectionHandle> {
        &self.documents
    }

    /// Database `name` on the connection serving `tenant`
    pub async fn database(&self, tenant: &str, name: &str) -> Result<Arc<dyn DocumentDatabase>> {
        self.documents.resolve(tenant)?.database(name).await
    }

    /// Collection in the database named after the project
    pub async fn collection(&self, project: &str, collection: &str) -> Result<Collection> {
        self.collection_in(project, project, collection).await
    }

    /// Collection in an explicitly named database
    pub async fn collection_in(&self, tenant: &str, database: &str, collection: &str) -> Result<Collection> {
        let database = self.database(tenant, database).await?;
        Ok(Collection {
            database,
            name: collection.to_string(),
            metrics: self.metrics.clone(),
        })
    }
}

/// One collection in one tenant database
#[derive(Clone)]
pub struct Collection {
    database: Arc<dyn DocumentDatabase>,
    name: String,
    metrics: Arc<dyn MetricsSink>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying database, for operations this wrapper does not cover
    pub fn database(&self) -> &Arc<dyn DocumentDatabase> {
        &self.database
    }

    async fn measured<T>(&self, operation: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = work.await;
        self.metrics.record(&OperationSample::new(
            operation,
            self.database.backend(),
            started,
            Outcome::of(&result),
        ));
        result
    }

    pub async fn find_one<T: DeserializeOwned>(&self, filter: &Filter) -> Result<Option<T>> {
        self.measured("find_one", async {
            let cursor = self.database.find(&self.name, filter, &FindOptions::new().limit(1)).await?;
            let mut slot = None;
            drain_first(&mut slot, cursor).await?;
            Ok(slot)
        })
        .await
    }

    pub async fn find_all<T: DeserializeOwned>(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.find_all_into(&mut out, filter, options).await?;
        Ok(out)
    }

    /// Append matches to `out`; on a decode error earlier matches stay appended
    pub async fn find_all_into<T: DeserializeOwned>(
        &self,
        out: &mut Vec<T>,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<usize> {
        self.measured("find_all", async {
            let cursor = self.database.find(&self.name, filter, options).await?;
            drain_all(out, cursor).await
        })
        .await
    }

    /// Fill a JSON array (`FindMode::All`) or a null/object slot (`FindMode::One`)
    pub async fn find_json(
        &self,
        target: &mut Value,
        mode: FindMode,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<usize> {
        self.measured("find_json", async {
            check_container(target, mode)?;
            let options = match mode {
                FindMode::All => options.clone(),
                FindMode::One => options.clone().limit(1),
            };
            let cursor = self.database.find(&self.name, filter, &options).await?;
            drain_json(target, mode, cursor).await
        })
        .await
    }

    /// Insert one document; returns its `_id`
    pub async fn insert_one<T: Serialize>(&self, document: &T) -> Result<Value> {
        self.measured("insert_one", async {
            let document = serde_json::to_value(document)?;
            self.database.insert_one(&self.name, document).await
        })
        .await
    }

    pub async fn insert_many<T: Serialize>(&self, documents: &[T]) -> Result<Vec<Value>> {
        self.measured("insert_many", async {
            let documents = documents
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            self.database.insert_many(&self.name, documents).await
        })
        .await
    }

    pub async fn update_one(&self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.measured("update_one", self.database.update(&self.name, filter, update, UpdateScope::One))
            .await
    }

    pub async fn update_all(&self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.measured("update_all", self.database.update(&self.name, filter, update, UpdateScope::Many))
            .await
    }

    /// Update the first match, or insert a document built from the filter's equalities
    pub async fn upsert_one(&self, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        self.measured("upsert_one", self.database.update(&self.name, filter, update, UpdateScope::Upsert))
            .await
    }

    pub async fn find_one_and_update<T: DeserializeOwned>(
        &self,
        filter: &Filter,
        update: &Update,
        return_updated: bool,
    ) -> Result<Option<T>> {
        self.measured("find_one_and_update", async {
            let found = self
                .database
                .find_one_and_update(&self.name, filter, update, return_updated)
                .await?;
            Ok(found.map(serde_json::from_value).transpose()?)
        })
        .await
    }

    pub async fn find_one_and_delete<T: DeserializeOwned>(&self, filter: &Filter) -> Result<Option<T>> {
        self.measured("find_one_and_delete", async {
            let found = self.database.find_one_and_delete(&self.name, filter).await?;
            Ok(found.map(serde_json::from_value).transpose()?)
        })
        .await
    }

    pub async fn delete_one(&self, filter: &Filter) -> Result<u64> {
        self.measured("delete_one", self.database.delete(&self.name, filter, false)).await
    }

    pub async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.measured("delete_many", self.database.delete(&self.name, filter, true)).await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        self.measured("count", self.database.count(&self.name, filter)).await
    }

    pub async fn aggregate<T: DeserializeOwned>(&self, pipeline: &[Value]) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.aggregate_into(&mut out, pipeline).await?;
        Ok(out)
    }

    /// Append pipeline results to `out`, decoding each as it arrives
    pub async fn aggregate_into<T: DeserializeOwned>(&self, out: &mut Vec<T>, pipeline: &[Value]) -> Result<usize> {
        self.measured("aggregate", async {
            let cursor = self.database.aggregate(&self.name, pipeline).await?;
            drain_all(out, cursor).await
        })
        .await
    }

    pub async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<BulkWriteResult> {
        self.measured("bulk_write", self.database.bulk_write(&self.name, models)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use crate::index::{CatalogProvisioner, IndexCatalog};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use crate::index::IndexSpec;
    use crate::metrics::{NoopMetrics, RecordingMetrics};
    use crate::store::{DocumentCursor, SqliteConnection, SqliteDatabase};
    use crate::Error;

    fn handle() -> Arc<ConnectionHandle> {
        Arc::new(ConnectionHandle::from_connection(
            Arc::new(SqliteConnection::in_memory()),
            Arc::new(CatalogProvisioner::new(IndexCatalog::builtin())),
        ))
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Install {
        adid: String,
        app_id: u32,
    }

    #[tokio::test]
    async fn test_tenants_route_to_their_connections() {
        let (alpha, beta, shared) = (handle(), handle(), handle());
        let registry = ClientRegistry::builder()
            .tenant("alpha", alpha.clone())
            .tenant("beta", beta.clone())
            .default_handle(shared.clone())
            .build();
        let store = TenantStore::new(Arc::new(registry));

        for (tenant, expected) in [("alpha", &alpha), ("beta", &beta), ("gamma", &shared), ("", &shared)] {
            let coll = store.collection_in(tenant, "adjust", "install").await.unwrap();
            let cached = expected.database("adjust").await.unwrap();
            assert!(Arc::ptr_eq(coll.database(), &cached), "tenant {:?}", tenant);
        }
    }

    #[tokio::test]
    async fn test_unknown_tenant_without_default() {
        let registry = ClientRegistry::builder().tenant("alpha", handle()).build();
        let store = TenantStore::new(Arc::new(registry));
        assert!(matches!(
            store.collection("gamma", "install").await,
            Err(Error::NoClientConfigured(t)) if t == "gamma"
        ));
    }

    #[tokio::test]
    async fn test_collection_operations() {
        let metrics = Arc::new(RecordingMetrics::new());
        let registry = ClientRegistry::builder().default_handle(handle()).build();
        let store = TenantStore::new(Arc::new(registry)).with_metrics(metrics.clone());
        let installs = store.collection_in("alpha", "adjust", "install").await.unwrap();

        installs
            .insert_many(&[
                Install { adid: "a1".into(), app_id: 1 },
                Install { adid: "a2".into(), app_id: 1 },
                Install { adid: "a3".into(), app_id: 2 },
            ])
            .await
            .unwrap();
        // adid is unique in the built-in catalog
        assert!(installs.insert_one(&Install { adid: "a1".into(), app_id: 9 }).await.is_err());

        let first: Option<Install> = installs.find_one(&Filter::new().eq("app_id", 1)).await.unwrap();
        assert_eq!(first.unwrap().adid, "a1");
        let all: Vec<Install> = installs.find_all(&Filter::new().eq("app_id", 1), &FindOptions::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let updated = installs.update_all(&Filter::new().eq("app_id", 1), &Update::new().set("app_id", 5)).await.unwrap();
        assert_eq!(updated.modified, 2);
        let upserted = installs
            .upsert_one(&Filter::new().eq("adid", "a4"), &Update::new().set("app_id", 7))
            .await
            .unwrap();
        assert!(upserted.upserted_id.is_some());
        assert_eq!(installs.count(&Filter::all()).await.unwrap(), 4);

        let before: Option<Install> = installs
            .find_one_and_update(&Filter::new().eq("adid", "a3"), &Update::new().inc("app_id", 1), false)
            .await
            .unwrap();
        assert_eq!(before.unwrap().app_id, 2);
        let removed: Option<Install> = installs.find_one_and_delete(&Filter::new().eq("adid", "a3")).await.unwrap();
        assert_eq!(removed.unwrap().app_id, 3);

        assert_eq!(installs.delete_one(&Filter::new().eq("app_id", 5)).await.unwrap(), 1);
        assert_eq!(installs.delete_many(&Filter::all()).await.unwrap(), 2);

        assert_eq!(metrics.count("insert_many"), 1);
        assert_eq!(metrics.count("insert_one"), 1);
        assert!(metrics.samples().iter().any(|s| s.operation == "insert_one" && s.outcome == Outcome::Error));
    }

    /// Wraps a SQLite database, counting queries and keeping the ordered bulk write default
    struct CountingDb {
        inner: Arc<SqliteDatabase>,
        finds: AtomicUsize,
    }

    #[async_trait]
    impl DocumentDatabase for CountingDb {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn backend(&self) -> &'static str {
            "counting"
        }

        async fn create_index(&self, spec: &IndexSpec) -> Result<String> {
            self.inner.create_index(spec).await
        }

        async fn list_indexes(&self, collection: &str) -> Result<Vec<String>> {
            self.inner.list_indexes(collection).await
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
            options: &FindOptions,
        ) -> Result<Box<dyn DocumentCursor>> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            self.inner.find(collection, filter, options).await
        }

        async fn insert_one(&self, collection: &str, document: Value) -> Result<Value> {
            self.inner.insert_one(collection, document).await
        }

        async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>> {
            self.inner.insert_many(collection, documents).await
        }

        async fn update(
            &self,
            collection: &str,
            filter: &Filter,
            update: &Update,
            scope: UpdateScope,
        ) -> Result<UpdateResult> {
            self.inner.update(collection, filter, update, scope).await
        }

        async fn find_one_and_update(
            &self,
            collection: &str,
            filter: &Filter,
            update: &Update,
            return_updated: bool,
        ) -> Result<Option<Value>> {
            self.inner.find_one_and_update(collection, filter, update, return_updated).await
        }

        async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
            self.inner.find_one_and_delete(collection, filter).await
        }

        async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> Result<u64> {
            self.inner.delete(collection, filter, many).await
        }

        async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
            self.inner.count(collection, filter).await
        }

        async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Box<dyn DocumentCursor>> {
            self.inner.aggregate(collection, pipeline).await
        }
    }

    fn counting_collection() -> (Collection, Arc<CountingDb>) {
        let db = Arc::new(CountingDb {
            inner: SqliteConnection::in_memory().open_sqlite("game").unwrap(),
            finds: AtomicUsize::new(0),
        });
        let coll = Collection {
            database: db.clone(),
            name: "events".to_string(),
            metrics: Arc::new(NoopMetrics),
        };
        (coll, db)
    }

    #[tokio::test]
    async fn test_find_json_rejects_wrong_target_before_querying() {
        let (events, db) = counting_collection();
        events.insert_one(&json!({"n": 1})).await.unwrap();

        for (mut target, mode) in [(json!(3), FindMode::All), (json!([]), FindMode::One), (json!("x"), FindMode::One)] {
            assert!(matches!(
                events.find_json(&mut target, mode, &Filter::all(), &FindOptions::new()).await,
                Err(Error::InvalidContainer(_))
            ));
        }
        assert_eq!(db.finds.load(Ordering::SeqCst), 0);

        let mut all = json!([]);
        events.find_json(&mut all, FindMode::All, &Filter::all(), &FindOptions::new()).await.unwrap();
        assert_eq!(db.finds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ordered_bulk_write_keeps_writes_before_a_failure() {
        let (events, _) = counting_collection();
        let err = events
            .bulk_write(vec![
                WriteModel::InsertOne(json!({"_id": 1, "n": 1})),
                WriteModel::UpdateOne {
                    filter: Filter::new().eq("n", 1),
                    update: Update::new().inc("n", 1),
                    upsert: false,
                },
                WriteModel::InsertOne(json!({"_id": 1, "n": 5})),
                WriteModel::DeleteMany(Filter::all()),
            ])
            .await;
        assert!(err.is_err());

        let left: Vec<Value> = events.find_all(&Filter::all(), &FindOptions::new()).await.unwrap();
        assert_eq!(left, vec![json!({"_id": 1, "n": 2})]);
    }

    #[tokio::test]
    async fn test_aggregate_into() {
        let metrics = Arc::new(RecordingMetrics::new());
        let registry = ClientRegistry::builder().default_handle(handle()).build();
        let store = TenantStore::new(Arc::new(registry)).with_metrics(metrics.clone());
        let installs = store.collection_in("alpha", "adjust", "install").await.unwrap();
        installs
            .bulk_write(
                (1..=4)
                    .map(|i| WriteModel::InsertOne(json!({"adid": format!("a{}", i), "app_id": i % 2})))
                    .collect(),
            )
            .await
            .unwrap();

        let mut out = vec![Install { adid: "seed".into(), app_id: 0 }];
        let pipeline = [json!({"$match": {"app_id": 1}}), json!({"$sort": {"adid": -1}})];
        assert_eq!(installs.aggregate_into(&mut out, &pipeline).await.unwrap(), 2);
        let adids: Vec<&str> = out.iter().map(|i| i.adid.as_str()).collect();
        assert_eq!(adids, vec!["seed", "a3", "a1"]);

        let typed: Vec<Install> = installs.aggregate(&[json!({"$limit": 1})]).await.unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(metrics.count("aggregate"), 2);
        assert_eq!(metrics.count("bulk_write"), 1);
    }

    #[tokio::test]
    async fn test_find_json() {
        let registry = ClientRegistry::builder().default_handle(handle()).build();
        let store = TenantStore::new(Arc::new(registry));
        let events = store.collection("alpha", "events").await.unwrap();
        events.insert_many(&[json!({"n": 1}), json!({"n": 2})]).await.unwrap();

        let mut all = json!([]);
        let n = events.find_json(&mut all, FindMode::All, &Filter::all(), &FindOptions::new()).await.unwrap();
        assert_eq!(n, 2);

        let mut one = Value::Null;
        events.find_json(&mut one, FindMode::One, &Filter::new().eq("n", 2), &FindOptions::new()).await.unwrap();
        assert_eq!(one["n"], json!(2));

        let mut wrong = json!(3);
        assert!(matches!(
            events.find_json(&mut wrong, FindMode::All, &Filter::all(), &FindOptions::new()).await,
            Err(Error::InvalidContainer(_))
        ));
    }
}
