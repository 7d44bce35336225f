use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::plan::StateMap;

/// Frontier of one execution after a node settled.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub execution_id: String,
    pub plan_id: String,
    /// Last node started or completed.
    pub last_node_id: Option<String>,
    /// Leaf nodes that already succeeded; skipped on resume.
    pub completed_nodes: Vec<String>,
    /// Serialized shared state (JSON object).
    pub state_json: String,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn state(&self) -> Result<StateMap> {
        Ok(serde_json::from_str(&self.state_json)?)
    }
}

fn storage(context: &str, e: impl std::fmt::Display) -> FlowgateError {
    FlowgateError::Storage(format!("{}: {}", context, e))
}

/// Persistent checkpoint store backed by SQLite. Keeps only the latest
/// checkpoint per execution.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| storage("open checkpoint store", e))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| storage("open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 execution_id TEXT PRIMARY KEY,
                 plan_id TEXT NOT NULL,
                 last_node_id TEXT,
                 completed_json TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 timestamp TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_plan ON checkpoints(plan_id);",
        )
        .map_err(|e| storage("initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| storage("checkpoint lock", e))
    }

    /// Save a checkpoint, replacing any previous one for the execution.
    pub fn save(&self, cp: &Checkpoint) -> Result<()> {
        let completed_json = serde_json::to_string(&cp.completed_nodes)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints
                 (execution_id, plan_id, last_node_id, completed_json, state_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cp.execution_id,
                cp.plan_id,
                cp.last_node_id,
                completed_json,
                cp.state_json,
                cp.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| storage("save checkpoint", e))?;
        Ok(())
    }

    /// Load the checkpoint for an execution.
    pub fn load(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, plan_id, last_node_id, completed_json, state_json, timestamp
                 FROM checkpoints
                 WHERE execution_id = ?1",
            )
            .map_err(|e| storage("prepare checkpoint query", e))?;

        let row = stmt.query_row(params![execution_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        });

        let (execution_id, plan_id, last_node_id, completed_json, state_json, ts) = match row {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(storage("load checkpoint", e)),
        };

        Ok(Some(Checkpoint {
            execution_id,
            plan_id,
            last_node_id,
            completed_nodes: serde_json::from_str(&completed_json)?,
            state_json,
            timestamp: DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Delete the checkpoint for an execution.
    pub fn delete(&self, execution_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE execution_id = ?1",
            params![execution_id],
        )
        .map_err(|e| storage("delete checkpoint", e))
    }
}
