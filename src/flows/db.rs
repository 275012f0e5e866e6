use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// String-valued local durable storage, the shape of browser local storage.
/// Every call is fallible I/O.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// SQLite-backed key-value storage for drafts.
///
/// Thread safety: wraps `Connection` in `Mutex`; the session shares one
/// store with its debounce task via `Arc`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the draft database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for tests).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS kv_state (
                 key              TEXT PRIMARY KEY NOT NULL,
                 value            TEXT NOT NULL,
                 updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
             );",
        )?;
        Ok(())
    }

    /// Keys currently stored, for inspection.
    pub fn keys(&self) -> anyhow::Result<Vec<String>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = guard.prepare("SELECT key FROM kv_state ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = guard
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute(
            "INSERT OR REPLACE INTO kv_state (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard.execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// In-process storage with an optional byte quota. A disabled store fails
/// every call, like storage blocked by the browser.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    disabled: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    fn ensure_enabled(&self) -> anyhow::Result<()> {
        if self.disabled {
            anyhow::bail!("storage is disabled");
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.ensure_enabled()?;
        let guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.ensure_enabled()?;
        let mut guard = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(quota) = self.quota_bytes {
            let used: usize = guard
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                anyhow::bail!("storage quota exceeded ({quota} bytes)");
            }
        }
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.ensure_enabled()?;
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_creates_table() {
        let db = SqliteStore::open_in_memory().unwrap();
        let guard = db.conn.lock().unwrap();
        let _: i64 = guard
            .query_row("SELECT COUNT(*) FROM kv_state", [], |r| r.get(0))
            .unwrap();
    }

    #[test]
    fn sqlite_store_roundtrip_and_overwrite() {
        let db = SqliteStore::open_in_memory().unwrap();
        db.set("instantmed_rx_draft", "old").unwrap();
        db.set("instantmed_rx_draft", "new").unwrap();
        assert_eq!(db.get("instantmed_rx_draft").unwrap(), Some("new".into()));
        assert_eq!(db.keys().unwrap(), vec!["instantmed_rx_draft".to_string()]);
    }

    #[test]
    fn sqlite_store_missing_and_remove() {
        let db = SqliteStore::open_in_memory().unwrap();
        assert!(db.get("nonexistent").unwrap().is_none());
        db.set("k", "v").unwrap();
        db.remove("k").unwrap();
        assert!(db.get("k").unwrap().is_none());
        // Removing a missing key is fine.
        db.remove("k").unwrap();
    }

    #[test]
    fn sqlite_store_persists_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("drafts.db");
        {
            let db = SqliteStore::open(&path).unwrap();
            db.set("k", "v").unwrap();
        }
        let db = SqliteStore::open(&path).unwrap();
        assert_eq!(db.get("k").unwrap(), Some("v".into()));
        assert_eq!(db.db_path(), path.as_path());
    }

    #[test]
    fn memory_store_quota() {
        let store = MemoryStore::with_quota(10);
        store.set("k", "12345").unwrap();
        // Overwriting the same key is measured without its old value.
        store.set("k", "123456789").unwrap();
        assert!(store.set("other", "x").is_err());
    }

    #[test]
    fn disabled_store_fails_every_call() {
        let store = MemoryStore::disabled();
        assert!(store.get("k").is_err());
        assert!(store.set("k", "v").is_err());
        assert!(store.remove("k").is_err());
    }
}
