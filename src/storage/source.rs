//! Read interface consumed by the sync subsystem

use std::path::PathBuf;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};

use super::connection::{Storage, StorageMode};
use crate::error::{MirrorError, Result};
use crate::types::{Row, RowFingerprint, StoreValue};

/// Local store as seen by change detection and the sync executor.
///
/// Methods are synchronous; async callers run them on the blocking pool.
pub trait RowSource: Send + Sync {
    /// All rows of a table, oldest first. Ordering is stable so that
    /// unchanged data always serializes identically.
    fn list_rows(&self, table: &str) -> Result<Vec<Row>>;

    /// Column names in table order, used as the header row
    fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// `(id, status, updated_at)` per row ordered by id
    fn fingerprints(&self, table: &str) -> Result<Vec<RowFingerprint>>;

    /// Files whose modification means the store changed. Empty when the
    /// backend is not file based.
    fn watch_paths(&self) -> Vec<PathBuf>;
}

/// Reject anything that is not an existing user table, before the name is
/// interpolated into SQL.
fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master
         WHERE type = 'table' AND name = ? AND name NOT LIKE 'sqlite_%'
         AND name != 'schema_version')",
        params![table],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(MirrorError::UnknownTable(table.to_string()))
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn to_store_value(value: ValueRef<'_>) -> StoreValue {
    match value {
        ValueRef::Null => StoreValue::Null,
        ValueRef::Integer(i) => StoreValue::Integer(i),
        ValueRef::Real(f) => StoreValue::Real(f),
        ValueRef::Text(t) => StoreValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => StoreValue::Blob(b.to_vec()),
    }
}

impl RowSource for Storage {
    fn list_rows(&self, table: &str) -> Result<Vec<Row>> {
        self.with_connection(|conn| {
            ensure_table(conn, table)?;
            let columns = table_columns(conn, table)?;
            let order = if columns.iter().any(|c| c == "created_at") {
                "ORDER BY created_at ASC, rowid ASC"
            } else {
                "ORDER BY rowid ASC"
            };

            let mut stmt = conn.prepare(&format!("SELECT * FROM \"{}\" {}", table, order))?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt
                .query_map([], |row| {
                    let mut fields = Vec::with_capacity(names.len());
                    for (idx, name) in names.iter().enumerate() {
                        fields.push((name.clone(), to_store_value(row.get_ref(idx)?)));
                    }
                    Ok(Row::new(fields))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            ensure_table(conn, table)?;
            table_columns(conn, table)
        })
    }

    fn fingerprints(&self, table: &str) -> Result<Vec<RowFingerprint>> {
        self.with_connection(|conn| {
            ensure_table(conn, table)?;
            let columns = table_columns(conn, table)?;
            let has = |name: &str| columns.iter().any(|c| c == name);

            let id = if has("id") { "id" } else { "rowid" };
            let status = if has("status") { "status" } else { "NULL" };
            let updated = if has("updated_at") { "updated_at" } else { "NULL" };

            let mut stmt = conn.prepare(&format!(
                "SELECT {id}, {status}, {updated} FROM \"{table}\" ORDER BY {id}"
            ))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RowFingerprint {
                        id: to_store_value(row.get_ref(0)?)
                            .as_text()
                            .unwrap_or_default(),
                        status: to_store_value(row.get_ref(1)?).as_text(),
                        updated_at: to_store_value(row.get_ref(2)?).as_text(),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        let Some(path) = self.file_path() else {
            return Vec::new();
        };
        let mut paths = vec![path.clone()];
        let suffixes: &[&str] = match self.storage_mode() {
            StorageMode::Local => &["-wal"],
            StorageMode::CloudSafe => &["-journal"],
        };
        for suffix in suffixes {
            let mut sibling = path.clone().into_os_string();
            sibling.push(suffix);
            paths.push(PathBuf::from(sibling));
        }
        paths
    }
}
