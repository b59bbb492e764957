//! Database connection management with WAL mode support
//!
//! The job-record store is a single SQLite file. Local mode uses WAL for
//! concurrent readers; cloud-safe mode keeps everything in the main file so
//! folder-sync tools and file notifications only ever see one file change.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::Result;

/// Journal strategy for the SQLite file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" | "cloud_safe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database, or `:memory:`
    pub db_path: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
}

/// Storage engine wrapping a single SQLite connection
pub struct Storage {
    config: StoreConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database with the given configuration
    pub fn open(config: StoreConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;

        run_migrations(&conn)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a database file in local (WAL) mode
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(StoreConfig {
            db_path: path.as_ref().to_string_lossy().into_owned(),
            storage_mode: StorageMode::Local,
        })
    }

    /// In-memory database for testing
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        })
    }

    fn create_connection(config: &StoreConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        Self::configure_pragmas(&conn, config.storage_mode)?;

        Ok(conn)
    }

    fn configure_pragmas(conn: &Connection, mode: StorageMode) -> Result<()> {
        match mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Backing file, if this store is a single file on disk
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.config.db_path == ":memory:" {
            None
        } else {
            Some(PathBuf::from(&self.config.db_path))
        }
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
        assert!(storage.file_path().is_none());
    }

    #[test]
    fn test_storage_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let storage = Storage::open(StoreConfig {
            db_path: path.to_string_lossy().into_owned(),
            storage_mode: StorageMode::CloudSafe,
        })
        .unwrap();
        assert_eq!(storage.storage_mode(), StorageMode::CloudSafe);
        assert_eq!(storage.file_path(), Some(path));

        let journal: String = storage
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(journal, "delete");
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("cloud-safe".parse::<StorageMode>(), Ok(StorageMode::CloudSafe));
        assert!("remote".parse::<StorageMode>().is_err());
    }
}
