use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub source: String,
    pub created_at: String,
    pub last_active: String,
    /// Opaque JSON string; the store does not interpret it beyond the
    /// CLI pid lookup.
    pub metadata: String,
}

const COLUMNS: &str = "session_id, source, created_at, last_active, metadata";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert: first save creates the row, later saves bump `last_active`
    /// and replace metadata. `created_at` never moves.
    #[instrument(skip(self, metadata))]
    pub fn save(&self, session_id: &str, source: &str, metadata: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, source, created_at, last_active, metadata)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(session_id)
                 DO UPDATE SET last_active = excluded.last_active,
                               metadata = excluded.metadata",
                rusqlite::params![session_id, source, now, metadata],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, session_id: &str) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE session_id = ?1"))?;
            let mut rows = stmt.query([session_id])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {session_id}"))),
            }
        })
    }

    /// Bump `last_active` only; metadata and `created_at` are untouched.
    /// Called when a conversation lands on the session.
    #[instrument(skip(self))]
    pub fn touch(&self, session_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_active = ?1 WHERE session_id = ?2",
                rusqlite::params![now, session_id],
            )?;
            Ok(())
        })
    }

    /// Most recent CLI session for this pid whose `last_active` falls inside
    /// the window, or None.
    #[instrument(skip(self))]
    pub fn find_active_cli(
        &self,
        pid: u32,
        within: Duration,
    ) -> Result<Option<SessionRow>, StoreError> {
        let cutoff = (Utc::now() - within).to_rfc3339();
        let pid_marker = format!("%\"pid\":{pid}%");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions
                 WHERE source = 'cli' AND metadata LIKE ?1 AND last_active >= ?2
                 ORDER BY last_active DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(rusqlite::params![pid_marker, cutoff])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Delete sessions idle since before the cutoff, plus their
    /// conversations. Returns the number of sessions removed.
    #[instrument(skip(self))]
    pub fn prune_inactive(&self, older_than: &str) -> Result<usize, StoreError> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM conversations WHERE session_id IN
                 (SELECT session_id FROM sessions WHERE last_active < ?1)",
                [older_than],
            )?;
            let pruned = tx.execute("DELETE FROM sessions WHERE last_active < ?1", [older_than])?;
            tx.commit()?;
            Ok(pruned)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        session_id: row_helpers::get(row, 0, "sessions", "session_id")?,
        source: row_helpers::get(row, 1, "sessions", "source")?,
        created_at: row_helpers::get(row, 2, "sessions", "created_at")?,
        last_active: row_helpers::get(row, 3, "sessions", "last_active")?,
        metadata: row_helpers::get(row, 4, "sessions", "metadata")?,
    })
}
