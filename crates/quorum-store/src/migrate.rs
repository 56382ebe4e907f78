use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::schema::SCHEMA_VERSION;

/// Versioned migration steps. Step N upgrades a version-(N-1) database.
/// Version 1 predates session tracking; version 2 adds the sessions table,
/// the conversations.session_id column and the session index.
const MIGRATIONS: &[(u32, &str)] = &[(
    2,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_active TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    ALTER TABLE conversations ADD COLUMN session_id TEXT;
    ALTER TABLE conversations ADD COLUMN embedding BLOB;
    CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active);
    "#,
)];

/// Copy the database file next to itself before touching the schema.
/// In-memory databases have nothing to back up.
pub fn backup_before_migration(db_path: &Path) -> Result<Option<PathBuf>, StoreError> {
    if db_path == Path::new(":memory:") || !db_path.exists() {
        return Ok(None);
    }
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup = db_path.with_extension(format!("backup-{stamp}.db"));
    std::fs::copy(db_path, &backup)?;
    info!(backup = %backup.display(), "database backed up before migration");
    Ok(Some(backup))
}

/// Apply all pending migration steps inside one transaction: either the
/// database ends at SCHEMA_VERSION or it is left untouched.
#[instrument(skip(db))]
pub fn migrate(db: &Database) -> Result<u32, StoreError> {
    db.with_conn_mut(|conn| {
        let current: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .unwrap_or(1);

        if current >= SCHEMA_VERSION {
            return Ok(current);
        }

        let tx = conn.transaction()?;
        for (version, sql) in MIGRATIONS {
            if *version > current {
                tx.execute_batch(sql)?;
                info!(version, "applied migration step");
            }
        }
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        tx.commit()?;
        Ok(SCHEMA_VERSION)
    })
}
