//! SQLite storage layer for Skiff.
//!
//! Provides the flat, persistent key-value primitive backing the runtime's
//! capability shims. The runtime itself treats stored values as opaque
//! bytes; namespacing and size limits are enforced one layer up, by the
//! key-value capability shim.
//!
//! # Architecture
//!
//! - One table, `kv(key TEXT PRIMARY KEY, value BLOB)`
//! - Keys are full namespaced strings (`service:bucket:key`), ordered
//!   lexicographically so prefix scans paginate naturally
//! - A `Mutex<Connection>` serializes access; the runtime is single logical
//!   thread of control, so contention is not a concern

mod error;

pub use error::{StorageError, StorageResult};

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Flat string-key to bytes-value store.
#[derive(Debug)]
pub struct KvBackend {
    conn: Mutex<Connection>,
}

impl KvBackend {
    /// Opens (creating if needed) a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened kv store");
        Self::init(conn)
    }

    /// Opens an in-memory store. Used in tests and ephemeral hosts.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::InvalidData("kv connection poisoned".into()))
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Inserts or replaces the value under `key`.
    pub fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Deletes the value under `key`. Deleting a missing key is a no-op.
    pub fn delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Returns whether a value exists under `key`.
    pub fn exists(&self, key: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns up to `limit` keys starting with `prefix`, in lexicographic
    /// order, strictly after `after` when given. The returned keys are the
    /// full stored keys, prefix included.
    pub fn keys_with_prefix(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<String>> {
        let conn = self.lock()?;
        // '\u{10FFFF}' sorts after any continuation of the prefix.
        let upper = format!("{prefix}\u{10FFFF}");
        let lower = match after {
            Some(a) if a > prefix => a.to_string(),
            _ => prefix.to_string(),
        };
        let strict = after.is_some();

        let mut stmt = conn.prepare(
            "SELECT key FROM kv
             WHERE key >= ?1 AND key < ?2 AND (?3 = 0 OR key > ?4)
             ORDER BY key
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                lower,
                upper,
                strict as i64,
                after.unwrap_or(""),
                limit as i64
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}
