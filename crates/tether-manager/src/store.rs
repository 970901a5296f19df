//! Durable session records.
//!
//! The rows are advisory, write-through state owned by the server's
//! database; the supervisor's in-memory registry wins on disagreement.
//! `SessionStore` abstracts the backing database so tests can run against
//! an in-memory map.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tether_core::{TetherError, TetherResult};

/// Lifecycle status of a durable session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(SessionStatus::Starting),
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// One durable session record.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    /// The child's working directory (the seeded workspace).
    pub workspace: PathBuf,
    pub status: SessionStatus,
    /// Last-known pid; refreshed on re-adoption.
    pub pid: Option<u32>,
    /// Source repository reference, owned by the server's CRUD layer.
    pub repo: Option<String>,
    /// Why the session stopped, when it did.
    pub stop_reason: Option<String>,
    /// Unix seconds.
    pub created_at: u64,
}

/// Unix seconds now.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Storage for durable session rows.
pub trait SessionStore: Send + Sync {
    /// Insert or replace a row.
    fn upsert(&self, row: &SessionRow) -> TetherResult<()>;

    fn get(&self, id: &str) -> TetherResult<Option<SessionRow>>;

    /// Rows with status starting or running.
    fn active(&self) -> TetherResult<Vec<SessionRow>>;

    fn set_status(&self, id: &str, status: SessionStatus) -> TetherResult<()>;

    fn set_pid(&self, id: &str, pid: u32) -> TetherResult<()>;

    /// Set status stopped and record the reason.
    fn mark_stopped(&self, id: &str, reason: &str) -> TetherResult<()>;
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, SessionRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a row outright (an operator action, not part of the
    /// write-through contract).
    pub fn remove(&self, id: &str) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.remove(id);
        }
    }
}

impl SessionStore for MemoryStore {
    fn upsert(&self, row: &SessionRow) -> TetherResult<()> {
        let mut rows = self.lock()?;
        let mut merged = row.clone();
        if let Some(existing) = rows.get(&row.id) {
            // On conflict the repo reference and creation time keep their
            // original values, matching the SQLite conflict clause.
            merged.repo = existing.repo.clone();
            merged.created_at = existing.created_at;
        }
        rows.insert(merged.id.clone(), merged);
        Ok(())
    }

    fn get(&self, id: &str) -> TetherResult<Option<SessionRow>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn active(&self) -> TetherResult<Vec<SessionRow>> {
        let mut rows: Vec<SessionRow> = self
            .lock()?
            .values()
            .filter(|r| matches!(r.status, SessionStatus::Starting | SessionStatus::Running))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    fn set_status(&self, id: &str, status: SessionStatus) -> TetherResult<()> {
        if let Some(row) = self.lock()?.get_mut(id) {
            row.status = status;
        }
        Ok(())
    }

    fn set_pid(&self, id: &str, pid: u32) -> TetherResult<()> {
        if let Some(row) = self.lock()?.get_mut(id) {
            row.pid = Some(pid);
        }
        Ok(())
    }

    fn mark_stopped(&self, id: &str, reason: &str) -> TetherResult<()> {
        if let Some(row) = self.lock()?.get_mut(id) {
            row.status = SessionStatus::Stopped;
            row.stop_reason = Some(reason.to_string());
        }
        Ok(())
    }
}

impl MemoryStore {
    fn lock(&self) -> TetherResult<std::sync::MutexGuard<'_, HashMap<String, SessionRow>>> {
        self.rows
            .lock()
            .map_err(|_| TetherError::Store("memory store lock poisoned".into()))
    }
}

/// SQLite-backed store (WAL mode, schema bootstrapped on open).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    workspace   TEXT NOT NULL,
    status      TEXT NOT NULL,
    pid         INTEGER,
    repo        TEXT,
    stop_reason TEXT,
    created_at  INTEGER NOT NULL
);
";

impl SqliteStore {
    pub fn open(path: &Path) -> TetherResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> TetherResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> TetherResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TetherError::Store("sqlite lock poisoned".into()))
    }
}

fn store_err(e: rusqlite::Error) -> TetherError {
    TetherError::Store(e.to_string())
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let status_raw: String = row.get("status")?;
    Ok(SessionRow {
        id: row.get("id")?,
        workspace: PathBuf::from(row.get::<_, String>("workspace")?),
        status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Error),
        pid: row.get::<_, Option<i64>>("pid")?.map(|p| p as u32),
        repo: row.get("repo")?,
        stop_reason: row.get("stop_reason")?,
        created_at: row.get::<_, i64>("created_at")? as u64,
    })
}

impl SessionStore for SqliteStore {
    fn upsert(&self, row: &SessionRow) -> TetherResult<()> {
        self.lock()?
            .execute(
                "INSERT INTO sessions (id, workspace, status, pid, repo, stop_reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     workspace = excluded.workspace,
                     status = excluded.status,
                     pid = excluded.pid,
                     stop_reason = excluded.stop_reason",
                rusqlite::params![
                    row.id,
                    row.workspace.to_string_lossy(),
                    row.status.as_str(),
                    row.pid.map(|p| p as i64),
                    row.repo,
                    row.stop_reason,
                    row.created_at as i64,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn get(&self, id: &str) -> TetherResult<Option<SessionRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sessions WHERE id = ?1")
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], row_from_sql)
            .map_err(store_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(store_err)?)),
            None => Ok(None),
        }
    }

    fn active(&self) -> TetherResult<Vec<SessionRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sessions WHERE status IN ('starting', 'running') ORDER BY id")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_from_sql)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    fn set_status(&self, id: &str, status: SessionStatus) -> TetherResult<()> {
        self.lock()?
            .execute(
                "UPDATE sessions SET status = ?2 WHERE id = ?1",
                rusqlite::params![id, status.as_str()],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn set_pid(&self, id: &str, pid: u32) -> TetherResult<()> {
        self.lock()?
            .execute(
                "UPDATE sessions SET pid = ?2 WHERE id = ?1",
                rusqlite::params![id, pid as i64],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn mark_stopped(&self, id: &str, reason: &str) -> TetherResult<()> {
        self.lock()?
            .execute(
                "UPDATE sessions SET status = 'stopped', stop_reason = ?2 WHERE id = ?1",
                rusqlite::params![id, reason],
            )
            .map_err(store_err)?;
        Ok(())
    }
}
