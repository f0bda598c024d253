//! SQLite-backed store. One database holds every named store; entries are
//! keyed `(store, key)` and rowid order stands in for insertion time when
//! trimming.

use crate::error::StorageError;
use crate::record::RequestKey;
use crate::store::{CachedResponse, StoreBackend};
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_store ON entries(store);
"#;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (creating if needed) the cache database at `path`, including
    /// any missing parent directories.
    pub fn open_file(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Purely in-memory database; contents are lost on drop. Used in tests
    /// and wherever persistence across restarts is not wanted.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StoreBackend for SqliteBackend {
    fn open(&self, store: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO stores (name) VALUES (?1)",
            params![store],
        )?;
        Ok(())
    }

    fn put(
        &self,
        store: &str,
        key: &RequestKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        let headers = serde_json::to_vec(&response.headers).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO stores (name) VALUES (?1)",
            params![store],
        )?;
        // INSERT OR REPLACE reassigns the rowid, so an overwritten entry
        // counts as newest for trim ordering.
        conn.execute(
            "INSERT OR REPLACE INTO entries (store, key, status, headers, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                store,
                key.as_str(),
                response.status,
                headers,
                response.body.as_ref()
            ],
        )?;
        Ok(())
    }

    fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
        let conn = self.conn.lock();
        let row: Option<(u16, Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT status, headers, body FROM entries WHERE store = ?1 AND key = ?2",
                params![store, key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((status, headers, body)) => {
                let headers: Vec<(String, String)> =
                    serde_json::from_slice(&headers).map_err(|e| StorageError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(CachedResponse {
                    status,
                    headers,
                    body: Bytes::from(body),
                }))
            }
            None => Ok(None),
        }
    }

    fn list_stores(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM stores ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn delete_store(&self, store: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries WHERE store = ?1", params![store])?;
        conn.execute("DELETE FROM stores WHERE name = ?1", params![store])?;
        Ok(())
    }

    fn len(&self, store: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE store = ?1",
            params![store],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn trim(&self, store: &str, max_entries: usize) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE store = ?1",
            params![store],
            |row| row.get(0),
        )?;
        let excess = (count as usize).saturating_sub(max_entries);
        if excess == 0 {
            return Ok(0);
        }
        let removed = conn.execute(
            "DELETE FROM entries WHERE store = ?1 AND rowid IN (
                 SELECT rowid FROM entries WHERE store = ?1 ORDER BY rowid LIMIT ?2
             )",
            params![store, excess as i64],
        )?;
        Ok(removed)
    }
}
