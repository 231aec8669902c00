// src/storage.rs
// Caller-supplied key-value persistence and the secret/data store split

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

// Per-wallet storage keys. The first four hold secrets and belong in the
// more ephemeral store tier; the last two are plain data.
pub fn messaging_key_key(wallet: &str) -> String {
    format!("MK_:{}", wallet)
}
pub fn enrollment_phrase_key(wallet: &str) -> String {
    format!("MP_:{}", wallet)
}
pub fn publication_message_key(wallet: &str) -> String {
    format!("KEY_:{}", wallet)
}
pub fn publication_signature_key(wallet: &str) -> String {
    format!("PMS_:{}", wallet)
}
pub fn subscription_start_key(wallet: &str) -> String {
    format!("message_subscription_start:{}", wallet)
}
pub fn message_statuses_key(wallet: &str) -> String {
    format!("message_statuses:{}", wallet)
}

/// Minimal key-value store the engine persists through. Implementations
/// must be safe to call from multiple tasks.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Session-scoped store; contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Durable store backed by a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn default_path() -> PathBuf {
        let app_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Keyroom");
        std::fs::create_dir_all(&app_dir).ok();
        app_dir.join("keyroom.db")
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(&Self::default_path())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key=?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("MK_:0xabc", "deadbeef").unwrap();
        }
        // Survives reopen.
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("MK_:0xabc").unwrap().as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(messaging_key_key("0xA"), "MK_:0xA");
        assert_eq!(enrollment_phrase_key("0xA"), "MP_:0xA");
        assert_eq!(publication_message_key("0xA"), "KEY_:0xA");
        assert_eq!(publication_signature_key("0xA"), "PMS_:0xA");
        assert_eq!(
            subscription_start_key("0xA"),
            "message_subscription_start:0xA"
        );
        assert_eq!(message_statuses_key("0xA"), "message_statuses:0xA");
    }
}
