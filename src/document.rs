//! Document model shared by every backend
//!
//! Documents travel as `serde_json::Value` objects across the store seam.
//! Filters and updates use a small Mongo-flavoured vocabulary:
//! - Filter: equality plus `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$exists`
//! - Update: `$set`, `$unset`, `$inc`
//! - Pipeline (portable subset): `$match`, `$sort`, `$skip`, `$limit`
//!
//! Field paths are dotted (`profile.level`).

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::{Error, Result};

/// Check a dotted field path: non-empty segments of `[A-Za-z0-9_-]`
pub fn validate_field_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("field path '{}'", path)))
    }
}

/// Read the value at a dotted path
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Write the value at a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            Error::InvalidUpdate(format!("cannot set '{}': parent is not an object", path))
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

/// Remove the value at a dotted path; returns whether something was removed
pub fn remove_path(doc: &mut Value, path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((parent, leaf)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                match current.get_mut(segment) {
                    Some(next) => current = next,
                    None => return false,
                }
            }
            current
                .as_object_mut()
                .map(|object| object.remove(leaf).is_some())
                .unwrap_or(false)
        }
        None => doc
            .as_object_mut()
            .map(|object| object.remove(path).is_some())
            .unwrap_or(false),
    }
}

// ========== Filters ==========

/// A single predicate on one field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl Condition {
    fn operator(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Exists(_) => "$exists",
        }
    }

    fn operand(&self) -> Value {
        match self {
            Self::Eq(v) | Self::Ne(v) | Self::Gt(v) | Self::Gte(v) | Self::Lt(v) | Self::Lte(v) => {
                v.clone()
            }
            Self::In(values) => Value::Array(values.clone()),
            Self::Exists(flag) => Value::Bool(*flag),
        }
    }

    fn parse(operator: &str, operand: Value) -> Result<Self> {
        Ok(match operator {
            "$eq" => Self::Eq(operand),
            "$ne" => Self::Ne(operand),
            "$gt" => Self::Gt(operand),
            "$gte" => Self::Gte(operand),
            "$lt" => Self::Lt(operand),
            "$lte" => Self::Lte(operand),
            "$in" => match operand {
                Value::Array(values) => Self::In(values),
                other => return Err(Error::InvalidFilter(format!("$in expects an array, got {}", other))),
            },
            "$exists" => match operand {
                Value::Bool(flag) => Self::Exists(flag),
                other => return Err(Error::InvalidFilter(format!("$exists expects a bool, got {}", other))),
            },
            other => return Err(Error::InvalidFilter(format!("unsupported operator {}", other))),
        })
    }
}

/// Conjunction of field predicates; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match all documents
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gt(value.into()))
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gte(value.into()))
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lt(value.into()))
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lte(value.into()))
    }

    pub fn is_in(self, field: &str, values: Vec<Value>) -> Self {
        self.with(field, Condition::In(values))
    }

    pub fn exists(self, field: &str, present: bool) -> Self {
        self.with(field, Condition::Exists(present))
    }

    pub fn with(mut self, field: &str, condition: Condition) -> Self {
        self.clauses.push((field.to_string(), condition));
        self
    }

    /// Conjunction of both filters
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Parse a Mongo-style filter document such as `{"level": {"$gte": 3}, "name": "x"}`
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Null => return Ok(Self::all()),
            Value::Object(object) => object,
            other => return Err(Error::InvalidFilter(format!("filter must be an object, got {}", other))),
        };

        let mut filter = Self::new();
        for (field, spec) in object {
            if field.starts_with('$') {
                return Err(Error::InvalidFilter(format!("unsupported top-level operator {}", field)));
            }
            validate_field_path(field)
                .map_err(|_| Error::InvalidFilter(format!("invalid field path '{}'", field)))?;

            match spec {
                Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                    for (operator, operand) in ops {
                        filter = filter.with(field, Condition::parse(operator, operand.clone())?);
                    }
                }
                other => filter = filter.with(field, Condition::Eq(other.clone())),
            }
        }
        Ok(filter)
    }

    /// Render back to a Mongo-style filter document
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (field, condition) in &self.clauses {
            let single_eq = matches!(condition, Condition::Eq(v) if !v.is_object())
                && self.clauses.iter().filter(|(f, _)| f == field).count() == 1;
            if single_eq {
                out.insert(field.clone(), condition.operand());
                continue;
            }
            let entry = out
                .entry(field.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ops) = entry {
                ops.insert(condition.operator().to_string(), condition.operand());
            }
        }
        Value::Object(out)
    }

    /// Document implied by the equality clauses, used to seed upserts
    pub fn seed_document(&self) -> Result<Value> {
        let mut doc = Value::Object(Map::new());
        for (field, condition) in &self.clauses {
            if let Condition::Eq(value) = condition {
                set_path(&mut doc, field, value.clone())?;
            }
        }
        Ok(doc)
    }
}

// ========== Updates ==========

/// A single field modification
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(String, Value),
    Unset(String),
    Inc(String, Value),
}

/// Ordered list of field modifications applied to each matched document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field.to_string(), value.into()));
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.ops.push(UpdateOp::Unset(field.to_string()));
        self
    }

    pub fn inc(mut self, field: &str, by: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Inc(field.to_string(), by.into()));
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Parse `{"$set": {...}, "$unset": {...}, "$inc": {...}}`
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidUpdate("update must be an object".to_string()))?;

        let mut update = Self::new();
        for (operator, fields) in object {
            let fields = fields.as_object().ok_or_else(|| {
                Error::InvalidUpdate(format!("{} expects an object of fields", operator))
            })?;
            for (field, operand) in fields {
                validate_field_path(field)
                    .map_err(|_| Error::InvalidUpdate(format!("invalid field path '{}'", field)))?;
                let op = match operator.as_str() {
                    "$set" => UpdateOp::Set(field.clone(), operand.clone()),
                    "$unset" => UpdateOp::Unset(field.clone()),
                    "$inc" if operand.is_number() => UpdateOp::Inc(field.clone(), operand.clone()),
                    "$inc" => {
                        return Err(Error::InvalidUpdate(format!("$inc on '{}' needs a number", field)))
                    }
                    other if other.starts_with('$') => {
                        return Err(Error::InvalidUpdate(format!("unsupported operator {}", other)))
                    }
                    _ => {
                        return Err(Error::InvalidUpdate(
                            "update document requires $-operators".to_string(),
                        ))
                    }
                };
                update.ops.push(op);
            }
        }
        Ok(update)
    }

    /// Render back to a Mongo-style update document
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for op in &self.ops {
            let (operator, field, operand) = match op {
                UpdateOp::Set(field, value) => ("$set", field, value.clone()),
                UpdateOp::Unset(field) => ("$unset", field, Value::String(String::new())),
                UpdateOp::Inc(field, by) => ("$inc", field, by.clone()),
            };
            if let Value::Object(fields) = out
                .entry(operator.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                fields.insert(field.clone(), operand);
            }
        }
        Value::Object(out)
    }

    /// Apply in order; returns whether the document changed
    pub fn apply(&self, doc: &mut Value) -> Result<bool> {
        let before = doc.clone();
        for op in &self.ops {
            match op {
                UpdateOp::Set(field, value) => set_path(doc, field, value.clone())?,
                UpdateOp::Unset(field) => {
                    remove_path(doc, field);
                }
                UpdateOp::Inc(field, by) => {
                    let next = match get_path(doc, field) {
                        None | Some(Value::Null) => by.clone(),
                        Some(current) => add_numbers(current, by).ok_or_else(|| {
                            Error::InvalidUpdate(format!("cannot $inc non-numeric field '{}'", field))
                        })?,
                    };
                    set_path(doc, field, next)?;
                }
            }
        }
        Ok(*doc != before)
    }
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.checked_add(y).map(Value::from),
        _ => {
            let sum = a.as_f64()? + b.as_f64()?;
            serde_json::Number::from_f64(sum).map(Value::Number)
        }
    }
}

// ========== Query options ==========

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for `find`
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<u64>,
    pub skip: u64,
    pub sort: Vec<(String, SortOrder)>,
    /// Documents fetched per round trip; backend default when unset
    pub batch_size: Option<u32>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// How many documents an update may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScope {
    One,
    Many,
    /// Update the first match or insert a document seeded from the filter
    Upsert,
}

/// Counts reported by an update
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Value>,
}

/// One write in an ordered bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne(Value),
    UpdateOne { filter: Filter, update: Update, upsert: bool },
    UpdateMany { filter: Filter, update: Update },
    DeleteOne(Filter),
    DeleteMany(Filter),
}

/// Totals of a bulk write; ids are keyed by model position
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkWriteResult {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
    pub inserted_ids: BTreeMap<usize, Value>,
    pub upserted_ids: BTreeMap<usize, Value>,
}

impl BulkWriteResult {
    pub fn add_update(&mut self, position: usize, result: UpdateResult) {
        self.matched += result.matched;
        self.modified += result.modified;
        if let Some(id) = result.upserted_id {
            self.upserted_ids.insert(position, id);
        }
    }
}

// ========== Aggregation ==========

/// Fold a pipeline of `$match`, `$sort`, `$skip` and `$limit` stages into one
/// find. Stages that cannot be folded, such as `$match` after `$limit`, are
/// `Unsupported`, as is every other stage.
pub fn fold_pipeline(pipeline: &[Value]) -> Result<(Filter, FindOptions)> {
    let mut filter = Filter::all();
    let mut options = FindOptions::new();

    for stage in pipeline {
        let (name, body) = match stage.as_object() {
            Some(object) if object.len() == 1 => object.iter().next().map(|(k, v)| (k.as_str(), v)),
            _ => None,
        }
        .ok_or_else(|| Error::InvalidFilter(format!("pipeline stage must have one key, got {}", stage)))?;
        let windowed = options.skip > 0 || options.limit.is_some();

        match name {
            "$match" if windowed => {
                return Err(Error::Unsupported("$match after $skip or $limit".to_string()));
            }
            "$match" => filter = filter.and(Filter::from_json(body)?),
            "$sort" if windowed => {
                return Err(Error::Unsupported("$sort after $skip or $limit".to_string()));
            }
            "$sort" => options.sort = parse_sort(body)?,
            "$skip" => {
                let n = stage_count(name, body)?;
                options.skip = options.skip.saturating_add(n);
                options.limit = options.limit.map(|limit| limit.saturating_sub(n));
            }
            "$limit" => {
                let n = stage_count(name, body)?;
                if n == 0 {
                    return Err(Error::InvalidFilter("$limit must be positive".to_string()));
                }
                options.limit = Some(options.limit.map_or(n, |limit| limit.min(n)));
            }
            other => return Err(Error::Unsupported(format!("pipeline stage {}", other))),
        }
    }
    Ok((filter, options))
}

fn parse_sort(body: &Value) -> Result<Vec<(String, SortOrder)>> {
    let object = body
        .as_object()
        .filter(|o| !o.is_empty())
        .ok_or_else(|| Error::InvalidFilter(format!("$sort needs a non-empty object, got {}", body)))?;
    object
        .iter()
        .map(|(field, direction)| {
            validate_field_path(field)?;
            match direction.as_i64() {
                Some(1) => Ok((field.clone(), SortOrder::Asc)),
                Some(-1) => Ok((field.clone(), SortOrder::Desc)),
                _ => Err(Error::InvalidFilter(format!("$sort direction for {} must be 1 or -1", field))),
            }
        })
        .collect()
}

fn stage_count(name: &str, body: &Value) -> Result<u64> {
    body.as_u64()
        .ok_or_else(|| Error::InvalidFilter(format!("{} needs a non-negative integer, got {}", name, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_from_json() {
        let filter = Filter::from_json(&json!({
            "userId": "u1",
            "level": {"$gte": 3, "$lt": 10},
            "profile.country": {"$in": ["DE", "FR"]},
        }))
        .unwrap();
        assert_eq!(filter.clauses().len(), 4);
        assert!(filter.clauses().contains(&("userId".to_string(), Condition::Eq(json!("u1")))));
        assert!(filter.clauses().contains(&("level".to_string(), Condition::Gte(json!(3)))));
    }

    #[test]
    fn test_filter_rejects_unknown_operators() {
        assert!(Filter::from_json(&json!({"a": {"$regex": "x"}})).is_err());
        assert!(Filter::from_json(&json!({"$or": []})).is_err());
        assert!(Filter::from_json(&json!([1, 2])).is_err());
        assert!(Filter::from_json(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_filter_to_json_groups_operators() {
        let filter = Filter::new().eq("name", "x").gt("level", 1).lte("level", 5);
        assert_eq!(
            filter.to_json(),
            json!({"name": "x", "level": {"$gt": 1, "$lte": 5}})
        );
    }

    #[test]
    fn test_seed_document_from_equalities() {
        let filter = Filter::new().eq("userId", "u1").eq("meta.slot", 2).gt("level", 1);
        assert_eq!(filter.seed_document().unwrap(), json!({"userId": "u1", "meta": {"slot": 2}}));
    }

    #[test]
    fn test_update_apply() {
        let mut doc = json!({"name": "a", "stats": {"wins": 1}, "tmp": true});
        let update = Update::new()
            .set("name", "b")
            .inc("stats.wins", 2)
            .inc("stats.losses", 1)
            .unset("tmp");

        assert!(update.apply(&mut doc).unwrap());
        assert_eq!(doc, json!({"name": "b", "stats": {"wins": 3, "losses": 1}}));

        let noop = Update::new().set("name", "b");
        assert!(!noop.apply(&mut doc).unwrap());
    }

    #[test]
    fn test_update_from_json() {
        let update = Update::from_json(&json!({"$set": {"a": 1}, "$inc": {"b": 2.5}})).unwrap();
        assert_eq!(update.ops().len(), 2);

        assert!(Update::from_json(&json!({"a": 1})).is_err());
        assert!(Update::from_json(&json!({"$inc": {"a": "x"}})).is_err());
        assert!(Update::from_json(&json!({"$push": {"a": 1}})).is_err());
    }

    #[test]
    fn test_inc_on_string_fails() {
        let mut doc = json!({"name": "a"});
        assert!(Update::new().inc("name", 1).apply(&mut doc).is_err());
    }

    #[test]
    fn test_fold_pipeline() {
        let (filter, options) = fold_pipeline(&[
            json!({"$match": {"app_id": 1}}),
            json!({"$sort": {"level": -1, "name": 1}}),
            json!({"$match": {"level": {"$gt": 2}}}),
            json!({"$limit": 10}),
            json!({"$skip": 3}),
            json!({"$limit": 20}),
        ])
        .unwrap();
        assert_eq!(filter, Filter::new().eq("app_id", 1).gt("level", 2));
        assert_eq!(
            options.sort,
            vec![("level".to_string(), SortOrder::Desc), ("name".to_string(), SortOrder::Asc)]
        );
        assert_eq!(options.skip, 3);
        assert_eq!(options.limit, Some(7));

        let (filter, options) = fold_pipeline(&[]).unwrap();
        assert!(filter.is_empty());
        assert_eq!(options.limit, None);
    }

    #[test]
    fn test_fold_pipeline_rejects_what_it_cannot_fold() {
        for pipeline in [
            vec![json!({"$group": {"_id": "$app_id"}})],
            vec![json!({"$limit": 5}), json!({"$match": {"a": 1}})],
            vec![json!({"$skip": 5}), json!({"$sort": {"a": 1}})],
        ] {
            assert!(matches!(fold_pipeline(&pipeline), Err(Error::Unsupported(_))), "{:?}", pipeline);
        }
        for pipeline in [
            vec![json!({"$limit": 0})],
            vec![json!({"$skip": -1})],
            vec![json!({"$sort": {"a": 2}})],
            vec![json!({"$match": {}, "$limit": 1})],
        ] {
            assert!(matches!(fold_pipeline(&pipeline), Err(Error::InvalidFilter(_))), "{:?}", pipeline);
        }
    }

    #[test]
    fn test_paths() {
        assert!(validate_field_path("profile.level").is_ok());
        assert!(validate_field_path("user_id-2").is_ok());
        assert!(validate_field_path("").is_err());
        assert!(validate_field_path("a..b").is_err());
        assert!(validate_field_path("a'); DROP").is_err());

        let mut doc = json!({"a": {"b": 1}});
        assert_eq!(get_path(&doc, "a.b"), Some(&json!(1)));
        assert!(remove_path(&mut doc, "a.b"));
        assert!(!remove_path(&mut doc, "a.c"));
        assert_eq!(doc, json!({"a": {}}));
    }
}
