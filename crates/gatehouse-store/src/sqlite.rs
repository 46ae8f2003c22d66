//! SQLite-based store implementation

use chrono::{DateTime, Local};
use gatehouse_api::{Cooldown, KeyState, QuotaUsage};
use gatehouse_util::MonitorKey;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::record::{decode_session, encode_session};
use crate::{
    AuditEvent, KeySnapshot, QuotaSnapshot, StateChange, Store, StoreError, StoreResult,
    WriteOutcome,
};

/// Buffered change-feed messages per subscriber before it starts lagging
const CHANGE_FEED_CAPACITY: usize = 256;

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StateChange>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            changes,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- One session per monitoring key
            CREATE TABLE IF NOT EXISTS sessions (
                key TEXT PRIMARY KEY,
                session_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cooldowns (
                key TEXT PRIMARY KEY,
                ends_at TEXT NOT NULL
            );

            -- Bumped on every write to a key's session or cooldown
            CREATE TABLE IF NOT EXISTS key_versions (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );

            -- Daily quota usage (single row)
            CREATE TABLE IF NOT EXISTS quota_usage (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cycle_start TEXT NOT NULL,
                units_used INTEGER NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn read_key_version(conn: &Connection, key: &MonitorKey) -> StoreResult<u64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM key_versions WHERE key = ?",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0) as u64)
}

fn read_key_state(conn: &Connection, key: &MonitorKey) -> StoreResult<KeyState> {
    let session_json: Option<String> = conn
        .query_row(
            "SELECT session_json FROM sessions WHERE key = ?",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let cooldown_str: Option<String> = conn
        .query_row(
            "SELECT ends_at FROM cooldowns WHERE key = ?",
            [key.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(KeyState {
        session: session_json.as_deref().map(decode_session).transpose()?,
        cooldown: cooldown_str
            .as_deref()
            .map(parse_timestamp)
            .transpose()?
            .map(Cooldown::until),
    })
}

fn write_key_state(
    tx: &Transaction<'_>,
    key: &MonitorKey,
    state: &KeyState,
    version: u64,
) -> StoreResult<()> {
    match &state.session {
        Some(session) => {
            tx.execute(
                r#"
                INSERT INTO sessions (key, session_json)
                VALUES (?, ?)
                ON CONFLICT(key)
                DO UPDATE SET session_json = excluded.session_json
                "#,
                params![key.as_str(), encode_session(session)?],
            )?;
        }
        None => {
            tx.execute("DELETE FROM sessions WHERE key = ?", [key.as_str()])?;
        }
    }

    match &state.cooldown {
        Some(cooldown) => {
            tx.execute(
                r#"
                INSERT INTO cooldowns (key, ends_at)
                VALUES (?, ?)
                ON CONFLICT(key)
                DO UPDATE SET ends_at = excluded.ends_at
                "#,
                params![key.as_str(), cooldown.ends_at.to_rfc3339()],
            )?;
        }
        None => {
            tx.execute("DELETE FROM cooldowns WHERE key = ?", [key.as_str()])?;
        }
    }

    tx.execute(
        r#"
        INSERT INTO key_versions (key, version)
        VALUES (?, ?)
        ON CONFLICT(key)
        DO UPDATE SET version = excluded.version
        "#,
        params![key.as_str(), version as i64],
    )?;

    Ok(())
}

impl Store for SqliteStore {
    fn read_key(&self, key: &MonitorKey) -> StoreResult<KeySnapshot> {
        let conn = self.lock()?;
        Ok(KeySnapshot {
            key: key.clone(),
            version: read_key_version(&conn, key)?,
            state: read_key_state(&conn, key)?,
        })
    }

    fn write_key_if_unchanged(
        &self,
        base: &KeySnapshot,
        next: KeyState,
    ) -> StoreResult<WriteOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = read_key_version(&tx, &base.key)?;
        if current != base.version {
            debug!(
                key = %base.key,
                expected = base.version,
                found = current,
                "Key write conflict"
            );
            return Ok(WriteOutcome::Conflict);
        }

        write_key_state(&tx, &base.key, &next, current + 1)?;
        tx.commit()?;
        drop(conn);

        debug!(key = %base.key, version = current + 1, "Key state written");

        if base.state != next {
            // No receivers is fine
            let _ = self.changes.send(StateChange {
                key: base.key.clone(),
                before: base.state.clone(),
                after: next,
            });
        }

        Ok(WriteOutcome::Committed)
    }

    fn list_keys(&self) -> StoreResult<Vec<MonitorKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM sessions UNION SELECT key FROM cooldowns ORDER BY key",
        )?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|key| key.map(MonitorKey::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn read_quota(&self) -> StoreResult<QuotaSnapshot> {
        let conn = self.lock()?;
        let row: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT cycle_start, units_used, version FROM quota_usage WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((cycle_start, units_used, version)) => Ok(QuotaSnapshot {
                usage: Some(QuotaUsage {
                    cycle_start: parse_timestamp(&cycle_start)?,
                    units_used: units_used.max(0) as u32,
                }),
                version: version as u64,
            }),
            None => Ok(QuotaSnapshot {
                usage: None,
                version: 0,
            }),
        }
    }

    fn write_quota_if_unchanged(
        &self,
        base: &QuotaSnapshot,
        next: QuotaUsage,
    ) -> StoreResult<WriteOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row("SELECT version FROM quota_usage WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let current = current.unwrap_or(0) as u64;
        if current != base.version {
            debug!(expected = base.version, found = current, "Quota write conflict");
            return Ok(WriteOutcome::Conflict);
        }

        tx.execute(
            r#"
            INSERT INTO quota_usage (id, cycle_start, units_used, version)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id)
            DO UPDATE SET cycle_start = excluded.cycle_start,
                          units_used = excluded.units_used,
                          version = excluded.version
            "#,
            params![
                next.cycle_start.to_rfc3339(),
                next.units_used as i64,
                (current + 1) as i64
            ],
        )?;
        tx.commit()?;

        debug!(
            cycle_start = %next.cycle_start,
            units_used = next.units_used,
            "Quota usage written"
        );
        Ok(WriteOutcome::Committed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.lock()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            events.push(AuditEvent {
                id,
                timestamp: parse_timestamp(&timestamp_str)?,
                event: serde_json::from_str(&event_json)?,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
