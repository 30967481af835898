//! Audit event store
//!
//! An append-only session/event timeline persisted in SQLite. Three retention
//! modes: `ephemeral` (accept and drop), `session` (persist, no pruning) and
//! `persistent` (persist, prune on startup). The connection runs in WAL mode
//! with foreign keys enforced; events cascade when their session is deleted.
//!
//! All statements execute on blocking worker threads behind a single mutex,
//! which gives the store its single-writer discipline.

mod error;

pub use error::StoreError;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use loqa_config::{EventStoreConfig, RetentionMode};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags};

/// One recorded timeline entry.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: i64,
    pub session_id: String,
    pub trace_id: Option<String>,
    pub actor_id: Option<String>,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub privacy_scope: String,
    pub created_at: DateTime<Utc>,
}

/// An event to append. `created_at` is filled in by the store when absent.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub session_id: String,
    pub trace_id: Option<String>,
    pub actor_id: Option<String>,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub privacy_scope: String,
    pub created_at: Option<DateTime<Utc>>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// SQLite-backed event timeline store. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    cfg: EventStoreConfig,
    db: Option<Arc<Mutex<Connection>>>,
    clock: Arc<RwLock<Clock>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    actor_id TEXT,
    privacy_scope TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    trace_id TEXT,
    actor_id TEXT,
    event_type TEXT,
    payload BLOB,
    privacy_scope TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY(session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_events_session_created ON events(session_id, created_at);
"#;

impl EventStore {
    /// Open the store according to config. For `ephemeral` no database is
    /// touched; otherwise the schema is created idempotently, an optional
    /// VACUUM runs, and `persistent` mode prunes on startup.
    pub async fn open(cfg: EventStoreConfig) -> Result<Self, StoreError> {
        let clock: Arc<RwLock<Clock>> = Arc::new(RwLock::new(Box::new(Utc::now)));

        if cfg.retention_mode == RetentionMode::Ephemeral {
            return Ok(Self {
                cfg,
                db: None,
                clock,
            });
        }

        let path = cfg.path.clone();
        let vacuum = cfg.vacuum_on_start;
        let conn = tokio::task::spawn_blocking(move || open_connection(&path, vacuum))
            .await
            .map_err(|e| StoreError::Background(e.to_string()))??;

        let store = Self {
            cfg: cfg.clone(),
            db: Some(Arc::new(Mutex::new(conn))),
            clock,
        };

        if cfg.retention_mode == RetentionMode::Persistent {
            if let Err(error) = store.prune().await {
                tracing::warn!(%error, "event store prune on start failed");
            }
        }

        Ok(store)
    }

    fn now(&self) -> DateTime<Utc> {
        (*self.clock.read())()
    }

    #[cfg(test)]
    fn set_clock(&self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        *self.clock.write() = Box::new(clock);
    }

    /// Idempotent session upsert. The creation timestamp of an existing
    /// session is preserved; actor and privacy scope are refreshed.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        actor_id: Option<&str>,
        privacy_scope: &str,
    ) -> Result<(), StoreError> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        let session_id = session_id.to_string();
        let actor_id = actor_id.map(str::to_string);
        let privacy_scope = privacy_scope.to_string();
        let created_at = self.now().timestamp_millis();

        run_blocking(move || {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO sessions(session_id, actor_id, privacy_scope, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE
                 SET actor_id = excluded.actor_id, privacy_scope = excluded.privacy_scope",
                params![session_id, actor_id, privacy_scope, created_at],
            )?;
            Ok(())
        })
        .await
    }

    /// Append one event. The referenced session must already exist.
    pub async fn append_event(&self, event: NewEvent) -> Result<(), StoreError> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        let created_at = event
            .created_at
            .unwrap_or_else(|| self.now())
            .timestamp_millis();

        run_blocking(move || {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO events(session_id, trace_id, actor_id, event_type, payload, privacy_scope, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.session_id,
                    event.trace_id,
                    event.actor_id,
                    event.event_type,
                    event.payload,
                    event.privacy_scope,
                    created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Up to `limit` events for one session, ascending by creation time.
    /// A zero limit falls back to 100.
    pub async fn list_session_events(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let Some(db) = self.db.clone() else {
            return Ok(Vec::new());
        };
        let session_id = session_id.to_string();
        let limit = if limit == 0 { 100 } else { limit };

        run_blocking(move || {
            let conn = db.lock();
            let mut stmt = conn.prepare(
                "SELECT id, session_id, trace_id, actor_id, event_type, payload, privacy_scope, created_at
                 FROM events WHERE session_id = ?1
                 ORDER BY created_at ASC, id ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit], |row| {
                Ok(AuditEvent {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    trace_id: row.get(2)?,
                    actor_id: row.get(3)?,
                    event_type: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    payload: row.get::<_, Option<Vec<u8>>>(5)?.unwrap_or_default(),
                    privacy_scope: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    created_at: millis_to_utc(row.get(7)?),
                })
            })?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
        .await
    }

    /// Apply retention: delete sessions older than `retention_days`, then
    /// evict oldest sessions beyond `max_sessions`. Events cascade. Safe to
    /// call repeatedly.
    pub async fn prune(&self) -> Result<(), StoreError> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        let retention_days = self.cfg.retention_days;
        let max_sessions = self.cfg.max_sessions;
        let cutoff = (self.now() - Duration::days(i64::from(retention_days))).timestamp_millis();

        run_blocking(move || {
            let mut conn = db.lock();
            let tx = conn.transaction()?;
            if retention_days > 0 {
                tx.execute("DELETE FROM sessions WHERE created_at < ?1", params![cutoff])?;
            }
            if max_sessions > 0 {
                tx.execute(
                    "DELETE FROM sessions WHERE session_id IN (
                         SELECT session_id FROM sessions
                         ORDER BY created_at DESC LIMIT -1 OFFSET ?1
                     )",
                    params![max_sessions],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn open_connection(path: &str, vacuum: bool) -> Result<Connection, StoreError> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Io(format!("create data dir: {e}")))?;
        }
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;

    if vacuum {
        if let Err(error) = conn.execute_batch("VACUUM") {
            tracing::warn!(%error, "event store vacuum failed");
        }
    }

    Ok(conn)
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_config(dir: &tempfile::TempDir, mode: RetentionMode) -> EventStoreConfig {
        EventStoreConfig {
            path: dir
                .path()
                .join("events.db")
                .to_string_lossy()
                .into_owned(),
            retention_mode: mode,
            retention_days: 30,
            max_sessions: 10_000,
            vacuum_on_start: false,
        }
    }

    fn event(session_id: &str, event_type: &str, payload: &[u8]) -> NewEvent {
        NewEvent {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_vec(),
            privacy_scope: "local".to_string(),
            ..NewEvent::default()
        }
    }

    #[tokio::test]
    async fn test_ephemeral_accepts_and_drops() {
        let cfg = EventStoreConfig {
            retention_mode: RetentionMode::Ephemeral,
            path: String::new(),
            ..EventStoreConfig::default()
        };
        let store = EventStore::open(cfg).await.unwrap();
        store.ensure_session("s1", None, "local").await.unwrap();
        store.append_event(event("s1", "test", b"x")).await.unwrap();
        assert!(store
            .list_session_events("s1", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(store_config(&dir, RetentionMode::Session))
            .await
            .unwrap();

        store
            .ensure_session("session-123", Some("actor-1"), "local")
            .await
            .unwrap();
        store
            .append_event(event("session-123", "test", b"hello"))
            .await
            .unwrap();

        let events = store.list_session_events("session-123", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"hello");
        assert_eq!(events[0].event_type, "test");
    }

    #[tokio::test]
    async fn test_event_ids_monotonic_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(store_config(&dir, RetentionMode::Session))
            .await
            .unwrap();

        store.ensure_session("s1", None, "local").await.unwrap();
        for i in 0..5u8 {
            store.append_event(event("s1", "tick", &[i])).await.unwrap();
        }

        let events = store.list_session_events("s1", 10).await.unwrap();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn test_prune_by_days_and_session_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = store_config(&dir, RetentionMode::Persistent);
        cfg.retention_days = 1;
        cfg.max_sessions = 1;
        let store = EventStore::open(cfg).await.unwrap();

        store.set_clock(|| Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        store.ensure_session("old", Some("actor"), "local").await.unwrap();
        store.append_event(event("old", "note", b"n")).await.unwrap();

        store.set_clock(|| Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap());
        store.ensure_session("new", Some("actor"), "local").await.unwrap();
        store.append_event(event("new", "note", b"n")).await.unwrap();

        store.prune().await.unwrap();

        assert!(store.list_session_events("old", 10).await.unwrap().is_empty());
        assert_eq!(store.list_session_events("new", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = store_config(&dir, RetentionMode::Persistent);
        cfg.retention_days = 1;
        cfg.max_sessions = 2;
        let store = EventStore::open(cfg).await.unwrap();

        store.ensure_session("a", None, "local").await.unwrap();
        store.append_event(event("a", "note", b"1")).await.unwrap();
        store.ensure_session("b", None, "local").await.unwrap();

        store.prune().await.unwrap();
        let first = store.list_session_events("a", 10).await.unwrap();
        store.prune().await.unwrap();
        let second = store.list_session_events("a", 10).await.unwrap();

        assert_eq!(first.len(), second.len());
    }

    #[tokio::test]
    async fn test_ensure_session_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::open(store_config(&dir, RetentionMode::Session))
            .await
            .unwrap();

        store.set_clock(|| Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        store.ensure_session("s1", Some("first"), "local").await.unwrap();
        store.set_clock(|| Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        store.ensure_session("s1", Some("second"), "private").await.unwrap();
        store.append_event(event("s1", "note", b"x")).await.unwrap();

        // Still one session row; events attach to it.
        let events = store.list_session_events("s1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
