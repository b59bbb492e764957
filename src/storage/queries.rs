//! Job record writes
//!
//! The training runner owns these rows; the sync subsystem only reads them.
//! These helpers exist for the runner-side glue and for tests. Every mutation
//! bumps `updated_at` so change detection notices it.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timestamp format used for every stored time (sortable, microsecond precision)
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A new training execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub id: String,
    pub preset: String,
    pub dataset: Option<String>,
    pub output_dir: Option<String>,
}

/// A new parameter variation for an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVariation {
    pub id: String,
    pub execution_id: Option<String>,
    pub name: String,
    pub parameters: serde_json::Value,
}

pub fn insert_execution(conn: &Connection, input: &NewExecution) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO executions (id, preset, dataset, output_dir, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![input.id, input.preset, input.dataset, input.output_dir, now, now],
    )?;
    Ok(())
}

/// Move an execution to a new status. Returns false if it does not exist.
pub fn update_execution_status(
    conn: &Connection,
    id: &str,
    status: &str,
    metrics: Option<&serde_json::Value>,
) -> Result<bool> {
    let now = now_timestamp();
    let metrics_json = metrics.map(serde_json::to_string).transpose()?;
    let (started_at, finished_at) = match status {
        "running" => (Some(now.clone()), None),
        "completed" | "failed" | "cancelled" => (None, Some(now.clone())),
        _ => (None, None),
    };

    let changed = conn.execute(
        "UPDATE executions SET
            status = ?,
            metrics = COALESCE(?, metrics),
            started_at = COALESCE(?, started_at),
            finished_at = COALESCE(?, finished_at),
            updated_at = ?
         WHERE id = ?",
        params![status, metrics_json, started_at, finished_at, now, id],
    )?;
    Ok(changed > 0)
}

pub fn delete_execution(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM executions WHERE id = ?", params![id])?;
    Ok(changed > 0)
}

pub fn insert_variation(conn: &Connection, input: &NewVariation) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO variations (id, execution_id, name, parameters, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            input.id,
            input.execution_id,
            input.name,
            serde_json::to_string(&input.parameters)?,
            now,
            now
        ],
    )?;
    Ok(())
}

/// Record a variation's outcome, optionally attaching a binary artifact
pub fn update_variation_result(
    conn: &Connection,
    id: &str,
    status: &str,
    score: Option<f64>,
    artifact: Option<&[u8]>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE variations SET
            status = ?,
            score = COALESCE(?, score),
            artifact = COALESCE(?, artifact),
            updated_at = ?
         WHERE id = ?",
        params![status, score, artifact, now_timestamp(), id],
    )?;
    Ok(changed > 0)
}

pub fn get_execution_status(conn: &Connection, id: &str) -> Result<Option<String>> {
    let status = conn
        .query_row(
            "SELECT status FROM executions WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn execution(id: &str) -> NewExecution {
        NewExecution {
            id: id.to_string(),
            preset: "lora-small".to_string(),
            dataset: Some("faces-v2".to_string()),
            output_dir: None,
        }
    }

    #[test]
    fn test_execution_lifecycle() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| insert_execution(conn, &execution("exec-1")))
            .unwrap();

        let updated = storage
            .with_connection(|conn| {
                update_execution_status(
                    conn,
                    "exec-1",
                    "completed",
                    Some(&serde_json::json!({"loss": 0.12})),
                )
            })
            .unwrap();
        assert!(updated);

        let status = storage
            .with_connection(|conn| get_execution_status(conn, "exec-1"))
            .unwrap();
        assert_eq!(status.as_deref(), Some("completed"));

        assert!(!storage
            .with_connection(|conn| update_execution_status(conn, "missing", "running", None))
            .unwrap());
        assert!(storage
            .with_connection(|conn| delete_execution(conn, "exec-1"))
            .unwrap());
    }

    #[test]
    fn test_variation_artifact() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                insert_variation(
                    conn,
                    &NewVariation {
                        id: "var-1".to_string(),
                        execution_id: None,
                        name: "lr=1e-4".to_string(),
                        parameters: serde_json::json!({"lr": 0.0001}),
                    },
                )?;
                update_variation_result(conn, "var-1", "done", Some(0.93), Some(&[1, 2, 3]))
            })
            .unwrap();
    }
}
