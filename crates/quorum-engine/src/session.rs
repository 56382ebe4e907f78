use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use quorum_store::{SessionRepo, StoreError};

use crate::error::ChainError;

/// Where a session originates; each source has its own id scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionSource {
    Cli,
    Ui,
    Api,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Ui => "ui",
            Self::Api => "api",
        }
    }
}

const MAX_SESSION_ID_LEN: usize = 64;
const CLI_REUSE_WINDOW_HOURS: i64 = 2;
const PRUNE_AFTER_DAYS: i64 = 7;
/// Probability that a save also prunes inactive sessions.
const CLEANUP_PROBABILITY: f64 = 0.1;

/// Validates and mints session identifiers, reuses active CLI sessions and
/// probabilistically prunes stale ones. Persistence failures are logged and
/// degrade to a sessionless chain; only malformed ids are surfaced.
pub struct SessionManager {
    repo: SessionRepo,
}

impl SessionManager {
    pub fn new(repo: SessionRepo) -> Self {
        Self { repo }
    }

    /// Accepted ids match `^[A-Za-z0-9_-]{1,64}$` bit-exactly.
    pub fn validate_session_id(session_id: &str) -> Result<(), ChainError> {
        if session_id.is_empty() {
            return Err(ChainError::InvalidSessionId("empty".into()));
        }
        if session_id.len() > MAX_SESSION_ID_LEN {
            return Err(ChainError::InvalidSessionId(format!(
                "too long ({} > {MAX_SESSION_ID_LEN})",
                session_id.len()
            )));
        }
        if !session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ChainError::InvalidSessionId(format!(
                "illegal characters in '{session_id}'"
            )));
        }
        Ok(())
    }

    /// Resolve the session for one request. Caller-supplied ids are
    /// validated and upserted; absent ids are minted per source. Returns
    /// None when persistence fails (the chain continues sessionless).
    #[instrument(skip(self, metadata))]
    pub fn resolve(
        &self,
        session_id: Option<&str>,
        source: SessionSource,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, ChainError> {
        let mut metadata = if metadata.is_object() {
            metadata
        } else {
            serde_json::json!({})
        };

        // CLI sessions are keyed by pid for the reuse lookup.
        let pid = metadata
            .get("pid")
            .and_then(|v| v.as_u64())
            .map(|p| p as u32)
            .unwrap_or_else(std::process::id);
        if source == SessionSource::Cli {
            metadata["pid"] = serde_json::json!(pid);
        }

        if let Some(id) = session_id {
            Self::validate_session_id(id)?;
            return Ok(self.save(id, source, &metadata));
        }

        let id = match source {
            SessionSource::Cli => {
                match self.repo.find_active_cli(pid, Duration::hours(CLI_REUSE_WINDOW_HOURS)) {
                    Ok(Some(existing)) => {
                        // Reuse without touching last_active; the next
                        // persisted conversation bumps it.
                        info!(session_id = %existing.session_id, pid, "reusing active CLI session");
                        return Ok(Some(existing.session_id));
                    }
                    Ok(None) => {
                        format!("cli-{pid}-{}", Utc::now().format("%Y%m%d%H%M%S"))
                    }
                    Err(e) => {
                        warn!(error = %e, "CLI session lookup failed; minting fresh session");
                        format!("cli-{pid}-{}", Utc::now().format("%Y%m%d%H%M%S"))
                    }
                }
            }
            SessionSource::Ui => format!("ui-{}-{}", Utc::now().timestamp_millis(), random_alnum(8)),
            SessionSource::Api => format!("api-{}-{}", Utc::now().timestamp_millis(), random_alnum(8)),
        };

        Ok(self.save(&id, source, &metadata))
    }

    /// Upsert with probabilistic cleanup. A store failure degrades to a
    /// sessionless chain; every swallow logs at warn.
    fn save(&self, id: &str, source: SessionSource, metadata: &serde_json::Value) -> Option<String> {
        let metadata_json = metadata.to_string();
        match self.repo.save(id, source.as_str(), &metadata_json) {
            Ok(()) => {
                self.maybe_cleanup();
                Some(id.to_string())
            }
            Err(e) => {
                warn!(session_id = id, error = %e, "session persistence failed; continuing without session");
                None
            }
        }
    }

    /// A conversation landed: bump the session's last_active.
    pub fn touch(&self, session_id: &str) {
        if let Err(e) = self.repo.touch(session_id) {
            warn!(session_id, error = %e, "failed to touch session");
        }
    }

    fn maybe_cleanup(&self) {
        let roll = (random_u64() % 1000) as f64 / 1000.0;
        if roll < CLEANUP_PROBABILITY {
            let cutoff = (Utc::now() - Duration::days(PRUNE_AFTER_DAYS)).to_rfc3339();
            match self.repo.prune_inactive(&cutoff) {
                Ok(pruned) if pruned > 0 => info!(pruned, "pruned inactive sessions"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "session cleanup failed"),
            }
        }
    }

    /// Manual cleanup entry point for the CLI.
    pub fn prune_now(&self, older_than_days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(older_than_days)).to_rfc3339();
        self.repo.prune_inactive(&cutoff)
    }
}

/// Simple non-cryptographic random u64 using thread-local xorshift state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

fn random_alnum(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| CHARSET[(random_u64() % CHARSET.len() as u64) as usize] as char)
        .collect()
}
