//! SQLite key-value store
//!
//! Expiry is lazy: expired rows are ignored by reads and overwritten by writes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use crate::{Error, Result};
use super::schema;
use super::KeyValueStore;

/// Rows whose `expires_at` has not passed
const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

pub struct SqliteKv {
    endpoint: String,
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Parse `sqlite::memory:` or `sqlite://<file>`
    pub fn open(endpoint: &str) -> Result<Self> {
        if endpoint == "sqlite::memory:" {
            return Self::in_memory();
        }
        let path = endpoint
            .strip_prefix("sqlite://")
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| Error::Connection(format!("malformed sqlite endpoint '{}'", endpoint)))?;
        let path = Path::new(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Connection(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Connection(format!("open {}: {}", path.display(), e)))?;
        Self::with_connection(endpoint, conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Connection(format!("open in-memory kv: {}", e)))?;
        Self::with_connection("sqlite::memory:", conn)
    }

    fn with_connection(endpoint: &str, conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        for stmt in schema::kv_schema_statements() {
            conn.execute(stmt, [])?;
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Connection("sqlite kv mutex poisoned".to_string()))
    }

    /// Drop expired rows; returns how many were removed
    pub fn sweep(&self) -> Result<u64> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now_millis()],
        )?;
        Ok(removed as u64)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Expiry in epoch milliseconds; sub-millisecond TTLs round up to 1ms
fn deadline(ttl: Duration) -> i64 {
    now_millis().saturating_add(ttl.as_millis().clamp(1, i64::MAX as u128) as i64)
}

#[async_trait]
impl KeyValueStore for SqliteKv {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, ttl.map(deadline)],
        )?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let conn = self.lock()?;
        // An expired holder counts as absent and is replaced in the same statement
        let changed = conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
            params![key, value, deadline(ttl), now_millis()],
        )?;
        Ok(changed == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            &format!("DELETE FROM kv WHERE key = ?1 AND {}", LIVE),
            params![key, now_millis()],
        )?;
        Ok(removed == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE key = ?1 AND value = ?3
             AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_millis(), expected],
        )?;
        Ok(removed == 1)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        let current: Option<(String, Option<i64>)> = tx
            .query_row(
                &format!("SELECT value, expires_at FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (value, expires_at) = match current {
            Some((raw, expires_at)) => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| Error::Unsupported(format!("value at '{}' is not an integer", key)))?;
                (parsed, expires_at)
            }
            None => (0, None),
        };
        let next = value
            .checked_add(by)
            .ok_or_else(|| Error::Unsupported(format!("increment of '{}' overflows", key)))?;

        tx.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, next.to_string(), expires_at],
        )?;
        tx.commit()?;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!("UPDATE kv SET expires_at = ?3 WHERE key = ?1 AND {}", LIVE),
            params![key, now_millis(), deadline(ttl)],
        )?;
        Ok(changed == 1)
    }
}
