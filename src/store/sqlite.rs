//! SQLite document store
//!
//! Each logical database is its own SQLite connection:
//! - `sqlite::memory:` keeps every database in a private in-memory connection
//! - `sqlite://<dir>` stores database `<name>` in `<dir>/<name>.db`
//!
//! Collections are tables of JSON documents. Indexes are expression indexes over
//! `json_extract`, tracked in `_indexes` so that redefinitions can be detected and
//! TTL rules enforced by `purge_expired`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use crate::document::{
    fold_pipeline, validate_field_path, BulkWriteResult, Condition, Filter, FindOptions, SortOrder, Update,
    UpdateResult, UpdateScope, WriteModel,
};
use crate::index::IndexSpec;
use crate::{Error, Result};
use super::schema::{self, quote_ident, physical_index_name};
use super::{DocumentConnection, DocumentCursor, DocumentDatabase};

const DEFAULT_BATCH_SIZE: u64 = 64;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Location {
    Memory,
    Directory(PathBuf),
}

/// Connection to a SQLite-backed document store
pub struct SqliteConnection {
    endpoint: String,
    location: Location,
}

impl SqliteConnection {
    /// Parse `sqlite::memory:` or `sqlite://<dir>`; the directory is created if missing
    pub fn open(endpoint: &str) -> Result<Self> {
        if endpoint == "sqlite::memory:" {
            return Ok(Self::in_memory());
        }
        let dir = endpoint
            .strip_prefix("sqlite://")
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| Error::Connection(format!("malformed sqlite endpoint '{}'", endpoint)))?;
        Self::at(Path::new(dir))
    }

    /// Databases live in private in-memory connections
    pub fn in_memory() -> Self {
        Self {
            endpoint: "sqlite::memory:".to_string(),
            location: Location::Memory,
        }
    }

    /// Databases live as `<name>.db` files under `dir`
    pub fn at(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Connection(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self {
            endpoint: format!("sqlite://{}", dir.display()),
            location: Location::Directory(dir.to_path_buf()),
        })
    }

    /// Open a database with its concrete type
    pub fn open_sqlite(&self, name: &str) -> Result<Arc<SqliteDatabase>> {
        validate_name("database", name)?;
        let conn = match &self.location {
            Location::Memory => Connection::open_in_memory(),
            Location::Directory(dir) => Connection::open(dir.join(format!("{}.db", name))),
        }
        .map_err(|e| Error::Connection(format!("open database {}: {}", name, e)))?;

        Ok(Arc::new(SqliteDatabase::new(name, conn)?))
    }
}

#[async_trait]
impl DocumentConnection for SqliteConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_database(&self, name: &str) -> Result<Arc<dyn DocumentDatabase>> {
        Ok(self.open_sqlite(name)?)
    }
}

/// One logical database backed by one SQLite connection
pub struct SqliteDatabase {
    name: String,
    conn: Arc<Mutex<Connection>>,
    open_cursors: Arc<AtomicUsize>,
}

impl SqliteDatabase {
    fn new(name: &str, conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        for stmt in schema::document_schema_statements() {
            conn.execute(stmt, [])?;
        }
        Ok(Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Cursors handed out and not yet closed or dropped
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::Connection("sqlite connection mutex poisoned".to_string()))
}

#[async_trait]
impl DocumentDatabase for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<String> {
        validate_name("collection", &spec.collection)?;
        if spec.fields.is_empty() {
            return Err(Error::InvalidName(format!("index on {} has no fields", spec.collection)));
        }
        for field in &spec.fields {
            validate_field_path(field)?;
        }
        let expire_field = match (&spec.expire_after, spec.fields.as_slice()) {
            (None, _) => None,
            (Some(_), [field]) => Some(field.clone()),
            (Some(_), _) => {
                return Err(Error::Unsupported("TTL indexes take exactly one field".to_string()))
            }
        };

        let name = spec.name();
        let definition = serde_json::to_string(spec)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let table = ensure_collection(&tx, &spec.collection)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT definition FROM _indexes WHERE collection = ?1 AND name = ?2",
                params![spec.collection, name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(found) if found == definition => return Ok(name),
            Some(found) => {
                return Err(Error::IndexConflict(format!(
                    "{}.{} already exists as {}",
                    spec.collection, name, found
                )))
            }
            None => {}
        }

        let columns = spec
            .fields
            .iter()
            .map(|field| format!("{} {}", json_extract(field), spec.order.as_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if spec.unique { "UNIQUE " } else { "" },
                quote_ident(&physical_index_name(&spec.collection, &name)),
                table,
                columns
            ),
            [],
        )?;
        tx.execute(
            "INSERT INTO _indexes (collection, name, definition, expire_field, expire_after_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                spec.collection,
                name,
                definition,
                expire_field,
                spec.expire_after.map(|d| d.as_secs() as i64),
            ],
        )?;
        tx.commit()?;

        Ok(name)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM _indexes WHERE collection = ?1 ORDER BY name")?;
        let names = stmt
            .query_map([collection], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Box<dyn DocumentCursor>> {
        validate_name("collection", collection)?;
        let (where_sql, params) = compile_filter(filter)?;
        let mut order = Vec::new();
        for (field, direction) in &options.sort {
            validate_field_path(field)?;
            let direction = match direction {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            order.push(format!("{} {}", json_extract(field), direction));
        }
        order.push("id ASC".to_string());

        let exists = collection_exists(&*self.lock()?, collection)?;
        let sql = format!(
            "SELECT doc FROM {} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            quote_ident(collection),
            where_sql,
            order.join(", ")
        );

        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SqliteCursor {
            conn: self.conn.clone(),
            sql,
            params,
            buffer: VecDeque::new(),
            offset: options.skip,
            remaining: options.limit,
            batch: options.batch_size.map(u64::from).filter(|b| *b > 0).unwrap_or(DEFAULT_BATCH_SIZE),
            exhausted: !exists,
            lease: Some(CursorLease(self.open_cursors.clone())),
        }))
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<Value> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let table = ensure_collection(&tx, collection)?;
        let id = insert_document(&tx, &table, document)?;
        tx.commit()?;
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<Vec<Value>> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        // All or nothing: a failing document rolls back the batch
        let tx = conn.transaction()?;
        let table = ensure_collection(&tx, collection)?;
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            ids.push(insert_document(&tx, &table, document)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        scope: UpdateScope,
    ) -> Result<UpdateResult> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let result = update_in(&tx, collection, filter, update, scope)?;
        tx.commit()?;
        Ok(result)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        return_updated: bool,
    ) -> Result<Option<Value>> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !collection_exists(&tx, collection)? {
            return Ok(None);
        }
        let table = quote_ident(collection);

        let Some((id, before)) = select_matches(&tx, &table, filter, true)?.into_iter().next() else {
            return Ok(None);
        };
        let mut after = before.clone();
        if apply_update(update, &mut after)? {
            write_document(&tx, &table, id, &after)?;
        }
        tx.commit()?;

        Ok(Some(if return_updated { after } else { before }))
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !collection_exists(&tx, collection)? {
            return Ok(None);
        }
        let table = quote_ident(collection);

        let Some((id, doc)) = select_matches(&tx, &table, filter, true)?.into_iter().next() else {
            return Ok(None);
        };
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
        tx.commit()?;

        Ok(Some(doc))
    }

    async fn delete(&self, collection: &str, filter: &Filter, many: bool) -> Result<u64> {
        validate_name("collection", collection)?;
        let conn = self.lock()?;
        delete_in(&conn, collection, filter, many)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        validate_name("collection", collection)?;
        let conn = self.lock()?;
        if !collection_exists(&conn, collection)? {
            return Ok(0);
        }
        let (where_sql, params) = compile_filter(filter)?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(collection), where_sql),
            params_from_iter(params),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Pipelines of `$match`, `$sort`, `$skip` and `$limit` run as one find
    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Box<dyn DocumentCursor>> {
        let (filter, options) = fold_pipeline(pipeline)?;
        self.find(collection, &filter, &options).await
    }

    /// One transaction: a failing model rolls back the whole batch
    async fn bulk_write(&self, collection: &str, models: Vec<WriteModel>) -> Result<BulkWriteResult> {
        validate_name("collection", collection)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut result = BulkWriteResult::default();
        for (position, model) in models.into_iter().enumerate() {
            match model {
                WriteModel::InsertOne(document) => {
                    let table = ensure_collection(&tx, collection)?;
                    result.inserted_ids.insert(position, insert_document(&tx, &table, document)?);
                    result.inserted += 1;
                }
                WriteModel::UpdateOne { filter, update, upsert } => {
                    let scope = if upsert { UpdateScope::Upsert } else { UpdateScope::One };
                    result.add_update(position, update_in(&tx, collection, &filter, &update, scope)?);
                }
                WriteModel::UpdateMany { filter, update } => {
                    result.add_update(position, update_in(&tx, collection, &filter, &update, UpdateScope::Many)?);
                }
                WriteModel::DeleteOne(filter) => result.deleted += delete_in(&tx, collection, &filter, false)?,
                WriteModel::DeleteMany(filter) => result.deleted += delete_in(&tx, collection, &filter, true)?,
            }
        }
        tx.commit()?;
        Ok(result)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let conn = self.lock()?;
        let rules = {
            let mut stmt = conn.prepare(
                "SELECT collection, expire_field, expire_after_secs FROM _indexes
                 WHERE expire_field IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut purged = 0u64;
        for (collection, field, expire_after) in rules {
            let path = json_path(&field);
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE json_type(doc, '{p}') IN ('integer', 'real')
                     AND json_extract(doc, '{p}') + ?1 <= ?2",
                    quote_ident(&collection),
                    p = path
                ),
                params![expire_after, now],
            )?;
            if deleted > 0 {
                tracing::debug!(database = %self.name, collection = %collection, deleted, "purged expired documents");
            }
            purged += deleted as u64;
        }
        Ok(purged)
    }
}

/// Releases the open-cursor count when closed or dropped
struct CursorLease(Arc<AtomicUsize>);

impl Drop for CursorLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Batched forward-only cursor over one query
pub struct SqliteCursor {
    conn: Arc<Mutex<Connection>>,
    sql: String,
    params: Vec<SqlValue>,
    buffer: VecDeque<Value>,
    offset: u64,
    remaining: Option<u64>,
    batch: u64,
    exhausted: bool,
    lease: Option<CursorLease>,
}

impl SqliteCursor {
    fn fetch_batch(&mut self) -> Result<()> {
        let want = match self.remaining {
            Some(remaining) => remaining.min(self.batch),
            None => self.batch,
        };
        if want == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let rows = {
            let conn = lock_connection(&self.conn)?;
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let mut params = self.params.clone();
            params.push(SqlValue::Integer(want as i64));
            params.push(SqlValue::Integer(self.offset as i64));
            let rows = stmt
                .query_map(params_from_iter(params), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let fetched = rows.len() as u64;
        self.offset += fetched;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= fetched;
        }
        if fetched < want {
            self.exhausted = true;
        }
        for raw in rows {
            self.buffer.push_back(serde_json::from_str(&raw)?);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentCursor for SqliteCursor {
    async fn next(&mut self) -> Result<Option<Value>> {
        if self.lease.is_none() {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch()?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.lease.take();
        self.buffer.clear();
        self.exhausted = true;
        Ok(())
    }
}

// ========== Helpers ==========

/// Database and collection names: `[A-Za-z0-9_.-]`, not starting with `_` or `sqlite_`
fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && !name.starts_with("sqlite_")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("{} '{}'", kind, name)))
    }
}

/// JSON path for a validated dotted field, every segment quoted
fn json_path(field: &str) -> String {
    let mut path = String::from("$");
    for segment in field.split('.') {
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    path
}

fn json_extract(field: &str) -> String {
    format!("json_extract(doc, '{}')", json_path(field))
}

fn collection_exists(conn: &Connection, collection: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [collection],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Create the collection table and its `_id` index if needed; returns the quoted table name
fn ensure_collection(conn: &Connection, collection: &str) -> Result<String> {
    let table = quote_ident(collection);
    if collection_exists(conn, collection)? {
        return Ok(table);
    }

    conn.execute(&schema::CREATE_COLLECTION_TABLE.replace("{table}", &table), [])?;
    conn.execute(
        &format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&physical_index_name(collection, "_id_")),
            table,
            json_extract("_id")
        ),
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO _indexes (collection, name, definition) VALUES (?1, '_id_', '_id unique')",
        [collection],
    )?;
    Ok(table)
}

fn insert_document(conn: &Connection, table: &str, mut document: Value) -> Result<Value> {
    let Some(object) = document.as_object_mut() else {
        return Err(Error::InvalidDocument(format!("expected a JSON object, got {}", document)));
    };
    let assign_id = !object.contains_key("_id");

    conn.execute(
        &format!("INSERT INTO {} (doc) VALUES (?1)", table),
        [serde_json::to_string(&document)?],
    )?;
    let rowid = conn.last_insert_rowid();
    if !assign_id {
        return Ok(document["_id"].clone());
    }

    // Unset `_id` falls back to the row id
    let id = Value::from(rowid);
    if let Some(object) = document.as_object_mut() {
        object.insert("_id".to_string(), id.clone());
    }
    write_document(conn, table, rowid, &document)?;
    Ok(id)
}

fn update_in(
    conn: &Connection,
    collection: &str,
    filter: &Filter,
    update: &Update,
    scope: UpdateScope,
) -> Result<UpdateResult> {
    if !collection_exists(conn, collection)? && scope != UpdateScope::Upsert {
        return Ok(UpdateResult::default());
    }
    let table = ensure_collection(conn, collection)?;

    let matches = select_matches(conn, &table, filter, scope != UpdateScope::Many)?;
    let mut result = UpdateResult {
        matched: matches.len() as u64,
        ..Default::default()
    };
    for (id, mut doc) in matches {
        if apply_update(update, &mut doc)? {
            write_document(conn, &table, id, &doc)?;
            result.modified += 1;
        }
    }

    if result.matched == 0 && scope == UpdateScope::Upsert {
        let mut seed = filter.seed_document()?;
        update.apply(&mut seed)?;
        result.upserted_id = Some(insert_document(conn, &table, seed)?);
    }
    Ok(result)
}

fn delete_in(conn: &Connection, collection: &str, filter: &Filter, many: bool) -> Result<u64> {
    if !collection_exists(conn, collection)? {
        return Ok(0);
    }
    let table = quote_ident(collection);
    let (where_sql, params) = compile_filter(filter)?;
    let sql = if many {
        format!("DELETE FROM {} WHERE {}", table, where_sql)
    } else {
        format!(
            "DELETE FROM {t} WHERE id = (SELECT id FROM {t} WHERE {w} ORDER BY id LIMIT 1)",
            t = table,
            w = where_sql
        )
    };
    let deleted = conn.execute(&sql, params_from_iter(params))?;
    Ok(deleted as u64)
}

fn write_document(conn: &Connection, table: &str, id: i64, document: &Value) -> Result<()> {
    conn.execute(
        &format!("UPDATE {} SET doc = ?1 WHERE id = ?2", table),
        params![serde_json::to_string(document)?, id],
    )?;
    Ok(())
}

fn apply_update(update: &Update, doc: &mut Value) -> Result<bool> {
    let id = doc.get("_id").cloned();
    let changed = update.apply(doc)?;
    if doc.get("_id").cloned() != id {
        return Err(Error::InvalidUpdate("_id is immutable".to_string()));
    }
    Ok(changed)
}

fn select_matches(conn: &Connection, table: &str, filter: &Filter, first_only: bool) -> Result<Vec<(i64, Value)>> {
    let (where_sql, params) = compile_filter(filter)?;
    let sql = format!(
        "SELECT id, doc FROM {} WHERE {} ORDER BY id{}",
        table,
        where_sql,
        if first_only { " LIMIT 1" } else { "" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, raw)| Ok((id, serde_json::from_str(&raw)?)))
        .collect()
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Placeholder for a bound operand; composite values compare as minified JSON text
fn placeholder(value: &Value) -> &'static str {
    if value.is_object() || value.is_array() {
        "json(?)"
    } else {
        "?"
    }
}

/// Translate a filter into a WHERE clause with positional parameters
fn compile_filter(filter: &Filter) -> Result<(String, Vec<SqlValue>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (field, condition) in filter.clauses() {
        validate_field_path(field).map_err(|_| Error::InvalidFilter(format!("invalid field path '{}'", field)))?;
        let expr = json_extract(field);
        let path = json_path(field);

        let clause = match condition {
            Condition::Eq(Value::Null) => format!("{} IS NULL", expr),
            Condition::Ne(Value::Null) => format!("{} IS NOT NULL", expr),
            Condition::Eq(v) => {
                params.push(to_sql(v));
                format!("{} = {}", expr, placeholder(v))
            }
            Condition::Ne(v) => {
                params.push(to_sql(v));
                format!("({e} IS NULL OR {e} <> {p})", e = expr, p = placeholder(v))
            }
            Condition::Gt(v) | Condition::Gte(v) | Condition::Lt(v) | Condition::Lte(v) => {
                let op = match condition {
                    Condition::Gt(_) => ">",
                    Condition::Gte(_) => ">=",
                    Condition::Lt(_) => "<",
                    _ => "<=",
                };
                params.push(to_sql(v));
                format!("{} {} {}", expr, op, placeholder(v))
            }
            Condition::In(values) => {
                let mut members = Vec::new();
                let mut includes_null = false;
                for v in values {
                    if v.is_null() {
                        includes_null = true;
                        continue;
                    }
                    params.push(to_sql(v));
                    members.push(placeholder(v));
                }
                let listed = if members.is_empty() {
                    "0".to_string()
                } else {
                    format!("{} IN ({})", expr, members.join(", "))
                };
                if includes_null {
                    format!("({} OR {} IS NULL)", listed, expr)
                } else {
                    listed
                }
            }
            Condition::Exists(true) => format!("json_type(doc, '{}') IS NOT NULL", path),
            Condition::Exists(false) => format!("json_type(doc, '{}') IS NULL", path),
        };
        clauses.push(clause);
    }

    let where_sql = if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    };
    Ok((where_sql, params))
}
