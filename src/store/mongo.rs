//! MongoDB document store

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{
    ClientOptions, IndexOptions, ReadPreference, ReturnDocument, SelectionCriteria, Tls, TlsOptions,
};
use mongodb::{Client, Collection, Cursor, IndexModel};
use serde_json::Value;
use crate::document::{Filter, FindOptions, SortOrder, Update, UpdateResult, UpdateScope};
use crate::index::IndexSpec;
use crate::{Error, Result};
use super::{redact, ConnectOptions, DocumentConnection, DocumentCursor, DocumentDatabase};

const DEFAULT_POOL_SIZE: u32 = 128;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct MongoConnection {
    endpoint: String,
    client: Client,
}

impl MongoConnection {
    /// Parse the URI, apply TLS and pool settings, read from the nearest member
    pub async fn connect(endpoint: &str, options: &ConnectOptions) -> Result<Self> {
        let mut client_options = ClientOptions::parse(endpoint).await?;
        if let Some(ca_file) = &options.ca_file {
            client_options.tls = Some(Tls::Enabled(
                TlsOptions::builder().ca_file_path(ca_file.clone()).build(),
            ));
        }
        client_options.max_pool_size = Some(options.pool_size.unwrap_or(DEFAULT_POOL_SIZE));
        let timeout = options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        client_options.connect_timeout = Some(timeout);
        client_options.server_selection_timeout = Some(timeout);
        client_options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::Nearest { options: Default::default() },
        ));

        let client = Client::with_options(client_options)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| Error::Connection(format!("ping {}: {}", redact(endpoint), e)))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl DocumentConnection for MongoConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_database(&self, name: &str) -> Result<Arc<dyn DocumentDatabase>> {
        Ok(Arc::new(MongoDatabase {
            name: name.to_string(),
            db: self.client.database(name),
        }))
    }
}

pub struct MongoDatabase {
    name: String,
    db: mongodb::Database,
}

impl MongoDatabase {
    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

fn to_bson_document(value: &Value) -> Result<Document> {
    Ok(bson::to_document(value)?)
}

fn to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}

fn sort_document(sort: &[(String, SortOrder)]) -> Document {
    let mut out = Document::new();
    for (field, order) in sort {
        let direction = match order {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        };
        out.insert(field.clone(), direction);
    }
    out
}

fn index_model(spec: &IndexSpec) -> IndexModel {
    let mut keys = Document::new();
    for field in &spec.fields {
        keys.insert(field.clone(), spec.order.direction());
    }

    let mut options = IndexOptions::default();
    options.name = Some(spec.name());
    if spec.unique {
        options.unique = Some(true);
    }
    options.expire_after = spec.expire_after;

    let mut model = IndexModel::default();
    model.keys = keys;
    model.options = Some(options);
    model
}

#[async_trait]
impl DocumentDatabase for MongoDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        "mongo"
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<String> {
        let created = self.collection(&spec.collection).create_index(index_model(spec)).await?;
        Ok(created.index_name)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>> {
        let mut names = self.collection(collection).list_index_names().await?;
        names.sort();
        Ok(names)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Box<dyn DocumentCursor>> {
        let coll = self.collection(collection);
        let mut action = coll.find(to_bson_document(&filter.to_json())?).skip(options.skip);
        if !options.sort.is_empty() {
            action = action.sort(sort_document(&options.sort));
        }
        if let Some(limit) = options.limit {
            action = action.limit(limit.min(i64::MAX as u64) as i64);
        }
        if let Some(batch) = options.batch_size {
            action = action.batch_size(batch);
        }
        let cursor = action.await?;
        Ok(Box::new(MongoCursor { cursor: Some(cursor) }))
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<Value> {
        if !document.is_object() {
            return Err(Error::InvalidDocument(format!("expected a JSON object, got {}", document)));
        }
        let inserted = self.collection(collection).insert_one(to_bson_document(&document)?).await?;
        Ok(to_json(inserted.inserted_id))
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>> {
        let docs = documents.iter().map(to_bson_document).collect::<Result<Vec<_>>>()?;
        let count = docs.len();
        let mut inserted = self.collection(collection).insert_many(docs).await?.inserted_ids;
        Ok((0..count)
            .map(|i| inserted.remove(&i).map(to_json).unwrap_or(Value::Null))
            .collect())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: UpdateScope,
    ) -> Result<UpdateResult> {
        let coll = self.collection(collection);
        let filter = to_bson_document(&filter.to_json())?;
        let update = to_bson_document(&update.to_json())?;
        let result = match scope {
            UpdateScope::One => coll.update_one(filter, update).await?,
            UpdateScope::Many => coll.update_many(filter, update).await?,
            UpdateScope::Upsert => coll.update_one(filter, update).upsert(true).await?,
        };
        Ok(UpdateResult {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.map(to_json),
        })
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        return_updated: bool,
    ) -> Result<Option<Value>> {
        let returned = self
            .collection(collection)
            .find_one_and_update(to_bson_document(&filter.to_json())?, to_bson_document(&update.to_json())?)
            .return_document(if return_updated { ReturnDocument::After } else { ReturnDocument::Before })
            .await?;
        Ok(returned.map(|d| to_json(Bson::Document(d))))
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let removed = self
            .collection(collection)
            .find_one_and_delete(to_bson_document(&filter.to_json())?)
            .await?;
        Ok(removed.map(|d| to_json(Bson::Document(d))))
    }

    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> Result<u64> {
        let coll = self.collection(collection);
        let filter = to_bson_document(&filter.to_json())?;
        let result = if many {
            coll.delete_many(filter).await?
        } else {
            coll.delete_one(filter).await?
        };
        Ok(result.deleted_count)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        Ok(self
            .collection(collection)
            .count_documents(to_bson_document(&filter.to_json())?)
            .await?)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Box<dyn DocumentCursor>> {
        let stages = pipeline.iter().map(to_bson_document).collect::<Result<Vec<_>>>()?;
        let cursor = self.collection(collection).aggregate(stages).await?;
        Ok(Box::new(MongoCursor { cursor: Some(cursor) }))
    }

    // Bulk writes use the ordered default: the 3.x driver only offers
    // client-level bulk writes, which need a MongoDB 8.0 server.
}

/// Server-side cursor; dropping it kills the cursor on the server
pub struct MongoCursor {
    cursor: Option<Cursor<Document>>,
}

#[async_trait]
impl DocumentCursor for MongoCursor {
    async fn next(&mut self) -> Result<Option<Value>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        if !cursor.advance().await? {
            self.cursor = None;
            return Ok(None);
        }
        let current = cursor.deserialize_current()?;
        Ok(Some(to_json(Bson::Document(current))))
    }

    async fn close(&mut self) -> Result<()> {
        self.cursor.take();
        Ok(())
    }
}
