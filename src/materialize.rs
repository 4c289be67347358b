//! Drain cursors into caller-owned containers
//!
//! The typed entry points decode each document into `T` as it arrives. The JSON
//! entry point is for callers that only know the container shape at runtime.
//!
//! Every entry point closes the cursor before returning, whether it finished,
//! failed to decode, or was handed the wrong container. A decode error stops the
//! drain; items appended before it stay in the container.

use serde::de::DeserializeOwned;
use serde_json::Value;
use crate::store::DocumentCursor;
use crate::{Error, Result};

/// Expected result cardinality for `drain_json`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Target must be a JSON array; every document is appended
    All,
    /// Target must be `null` or an object; it receives the first document
    One,
}

/// Append every remaining document to `out`; returns how many were appended
pub async fn drain_all<T: DeserializeOwned>(
    out: &mut Vec<T>,
    mut cursor: Box<dyn DocumentCursor>,
) -> Result<usize> {
    let drained = append_all(out, cursor.as_mut()).await;
    finish(cursor, drained).await
}

/// Store the first document in `slot`; true when there was one
pub async fn drain_first<T: DeserializeOwned>(
    slot: &mut Option<T>,
    mut cursor: Box<dyn DocumentCursor>,
) -> Result<bool> {
    let first = take_first(slot, cursor.as_mut()).await;
    finish(cursor, first).await
}

/// Reject a target whose JSON shape cannot hold `mode` results.
/// Callers run this before issuing the query.
pub fn check_container(target: &Value, mode: FindMode) -> Result<()> {
    match (mode, target) {
        (FindMode::All, Value::Array(_)) | (FindMode::One, Value::Null | Value::Object(_)) => Ok(()),
        (FindMode::All, other) => Err(Error::InvalidContainer(format!(
            "find all needs an array target, got {}",
            kind(other)
        ))),
        (FindMode::One, other) => Err(Error::InvalidContainer(format!(
            "find one needs a null or object target, got {}",
            kind(other)
        ))),
    }
}

/// Fill a JSON container whose shape must match `mode`
pub async fn drain_json(
    target: &mut Value,
    mode: FindMode,
    mut cursor: Box<dyn DocumentCursor>,
) -> Result<usize> {
    if let Err(e) = check_container(target, mode) {
        return finish(cursor, Err(e)).await;
    }
    let drained = match target {
        Value::Array(items) => append_all(items, cursor.as_mut()).await,
        slot => match cursor.next().await {
            Ok(Some(doc)) => {
                *slot = doc;
                Ok(1)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(e),
        },
    };
    finish(cursor, drained).await
}

async fn take_first<T: DeserializeOwned>(slot: &mut Option<T>, cursor: &mut dyn DocumentCursor) -> Result<bool> {
    match cursor.next().await? {
        Some(doc) => {
            *slot = Some(serde_json::from_value(doc)?);
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn append_all<T: DeserializeOwned>(out: &mut Vec<T>, cursor: &mut dyn DocumentCursor) -> Result<usize> {
    let mut appended = 0;
    while let Some(doc) = cursor.next().await? {
        out.push(serde_json::from_value(doc)?);
        appended += 1;
    }
    Ok(appended)
}

/// Close the cursor; the drain error wins over a close error
async fn finish<T>(mut cursor: Box<dyn DocumentCursor>, drained: Result<T>) -> Result<T> {
    let closed = cursor.close().await;
    let value = drained?;
    closed?;
    Ok(value)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
