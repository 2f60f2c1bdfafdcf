//! SQLite-backed trust and audit store.
//!
//! Three tables: `events` (audit trail), `trusted_rules` (trust entries) and
//! `session_state` (small key/value memory such as the last session id).
//! The schema is created idempotently on open. Many short-lived guard
//! processes share one file, so the connection runs in WAL mode with a
//! bounded busy timeout.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::audit::AuditEvent;
use crate::error::StoreError;
use crate::logging::{ensure_parent_dir, set_file_permissions};
use crate::trust::{TrustEntry, TrustGrant, TrustScope};

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Key under which the most recent session id is remembered.
pub const LAST_SESSION_KEY: &str = "last_session_id";

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    session_id TEXT,
    tool_use_id TEXT,
    category TEXT NOT NULL,
    rule TEXT,
    action TEXT NOT NULL,
    command TEXT,
    detail TEXT
);
CREATE TABLE IF NOT EXISTS trusted_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_name TEXT NOT NULL,
    match_pattern TEXT,
    scope TEXT NOT NULL,
    session_id TEXT,
    created_ts TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS session_state (
    key TEXT PRIMARY KEY,
    value TEXT,
    updated_ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trust_rule_match_scope
    ON trusted_rules(rule_name, COALESCE(match_pattern, ''), scope);
";

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Identifiers attached to every audit row.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventIds<'a> {
    pub session_id: Option<&'a str>,
    pub tool_use_id: Option<&'a str>,
}

/// A stored audit row, as read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub ts: String,
    pub session_id: Option<String>,
    pub tool_use_id: Option<String>,
    pub category: String,
    pub rule: Option<String>,
    pub action: String,
    pub command: Option<String>,
    pub detail: Option<String>,
}

pub struct GuardStore {
    conn: Connection,
}

impl std::fmt::Debug for GuardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl GuardStore {
    /// Open (creating if needed) the store at `path`.
    ///
    /// The containing directory is created owner-only; the database file
    /// and its WAL side files are chmod'ed to `0600`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        ensure_parent_dir(path).map_err(|source| StoreError::Prepare {
            path: path.to_path_buf(),
            source,
        })?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        set_file_permissions(path, 0o600).map_err(|source| StoreError::Prepare {
            path: path.to_path_buf(),
            source,
        })?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = Path::new(&side);
            if side.exists() {
                let _ = set_file_permissions(side, 0o600);
            }
        }
        tracing::trace!(path = %path.display(), "guard store opened");
        Ok(Self { conn })
    }

    /// Private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn log_event(&self, ids: EventIds<'_>, event: &AuditEvent) -> Result<(), StoreError> {
        let detail = event
            .detail
            .as_ref()
            .map(serde_json::Value::to_string);
        self.conn.execute(
            "INSERT INTO events
                (ts, session_id, tool_use_id, category, rule, action, command, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                now_ts(),
                ids.session_id,
                ids.tool_use_id,
                event.category.as_str(),
                event.rule,
                event.action.as_str(),
                event.stored_subject(),
                detail,
            ],
        )?;
        Ok(())
    }

    /// Most recent events first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, session_id, tool_use_id, category, rule, action, command, detail
             FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = stmt
            .query_map([limit], |row| {
                Ok(StoredEvent {
                    ts: row.get(0)?,
                    session_id: row.get(1)?,
                    tool_use_id: row.get(2)?,
                    category: row.get(3)?,
                    rule: row.get(4)?,
                    action: row.get(5)?,
                    command: row.get(6)?,
                    detail: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ========================================================================
    // Trust
    // ========================================================================

    /// Whether any entry for `rule_name` pre-approves `subject`.
    pub fn check_trust(
        &self,
        rule_name: &str,
        subject: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .trust_entries(Some(rule_name))?
            .iter()
            .any(|entry| entry.permits(subject, session_id)))
    }

    /// Insert or replace the entry keyed by (rule, match, scope).
    pub fn add_trust(&self, grant: &TrustGrant) -> Result<TrustEntry, StoreError> {
        let entry = TrustEntry {
            rule_name: grant.rule_name.clone(),
            match_pattern: grant.match_pattern.clone(),
            scope: grant.scope,
            session_id: grant.session_id.clone(),
            created_ts: now_ts(),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO trusted_rules
                (rule_name, match_pattern, scope, session_id, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.rule_name,
                entry.match_pattern,
                entry.scope.as_str(),
                entry.session_id,
                entry.created_ts,
            ],
        )?;
        Ok(entry)
    }

    /// Remove entries for `rule_name`; with `match_pattern`, only the entry
    /// whose stored substring equals it (empty matches "no substring").
    pub fn remove_trust(
        &self,
        rule_name: &str,
        match_pattern: Option<&str>,
    ) -> Result<usize, StoreError> {
        let removed = match match_pattern {
            Some(pattern) => self.conn.execute(
                "DELETE FROM trusted_rules
                 WHERE rule_name = ?1 AND COALESCE(match_pattern, '') = ?2",
                params![rule_name, pattern],
            )?,
            None => self.conn.execute(
                "DELETE FROM trusted_rules WHERE rule_name = ?1",
                params![rule_name],
            )?,
        };
        Ok(removed)
    }

    pub fn list_trust(&self) -> Result<Vec<TrustEntry>, StoreError> {
        self.trust_entries(None)
    }

    fn trust_entries(&self, rule_name: Option<&str>) -> Result<Vec<TrustEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_name, match_pattern, scope, session_id, created_ts
             FROM trusted_rules
             WHERE ?1 IS NULL OR rule_name = ?1
             ORDER BY created_ts, id",
        )?;
        let entries = stmt
            .query_map([rule_name], |row| {
                let scope: String = row.get(2)?;
                Ok(TrustEntry {
                    rule_name: row.get(0)?,
                    match_pattern: row.get(1)?,
                    // Unknown scopes are treated as the narrower one.
                    scope: scope.parse().unwrap_or(TrustScope::Session),
                    session_id: row.get(3)?,
                    created_ts: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ========================================================================
    // Session state
    // ========================================================================

    pub fn set_session_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO session_state (key, value, updated_ts) VALUES (?1, ?2, ?3)",
            params![key, value, now_ts()],
        )?;
        Ok(())
    }

    pub fn session_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                [key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn remember_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.set_session_state(LAST_SESSION_KEY, session_id)
    }

    pub fn last_session_id(&self) -> Result<Option<String>, StoreError> {
        self.session_state(LAST_SESSION_KEY)
    }
}
