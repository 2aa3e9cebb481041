//! Append-only SQLite log of normalized events.

use crate::error::StoreError;
use crate::normalize::{EventKind, EventSummary, NormalizedEvent};
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::warn;

impl ToSql for EventKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        EventKind::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown event kind `{text}`").into()))
    }
}

/// A stored event as returned by the read API. The raw payload is never
/// selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEvent {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub summary: EventSummary,
}

/// Shared handle to the event log. Cloning is cheap; all clones use the same
/// connection.
#[derive(Debug, Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Opens (creating if needed) the database named by `url`, a SQLite path
    /// or `:memory:`.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(url)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        bootstrap(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts one event and returns its identifier once SQLite has
    /// committed it.
    pub async fn append(&self, event: NormalizedEvent) -> Result<String, StoreError> {
        let raw = serde_json::to_string(&event.raw)?;
        let received_at = Utc::now().to_rfc3339();
        let summary = event.summary;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (type, author, from_branch, to_branch, timestamp, received_at, raw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    summary.kind,
                    summary.author,
                    summary.from_branch,
                    summary.to_branch,
                    summary.timestamp,
                    received_at,
                    raw
                ],
            )?;
            Ok(conn.last_insert_rowid().to_string())
        })
        .await
    }

    /// Up to `limit` events, newest `timestamp` first.
    ///
    /// Timestamps compare as strings. NULL sorts lowest in SQLite, so events
    /// without a timestamp come last; equal timestamps put the later insert
    /// first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, author, from_branch, to_branch, timestamp
                 FROM events
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(StoredEvent {
                    id: row.get::<_, i64>(0)?.to_string(),
                    summary: EventSummary {
                        kind: row.get(1)?,
                        author: row.get(2)?,
                        from_branch: row.get(3)?,
                        to_branch: row.get(4)?,
                        timestamp: row.get(5)?,
                    },
                })
            })?;
            let events = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }

    /// Closes the connection. Handles still held elsewhere keep it open until
    /// the last one drops.
    pub fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().map_err(|_| StoreError::Poisoned)?;
                conn.close().map_err(|(_, err)| StoreError::Sql(err))
            }
            Err(_) => {
                warn!("Event store still shared at shutdown; closing with the last handle");
                Ok(())
            }
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&*guard)
        })
        .await?
    }
}

fn bootstrap(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          type TEXT NOT NULL CHECK (type IN ('push', 'pull_request', 'merge')),
          author TEXT,
          from_branch TEXT,
          to_branch TEXT NOT NULL,
          timestamp TEXT,
          received_at TEXT NOT NULL,
          raw TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS events_no_update
        BEFORE UPDATE ON events
        BEGIN
          SELECT RAISE(ABORT, 'events are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS events_no_delete
        BEFORE DELETE ON events
        BEGIN
          SELECT RAISE(ABORT, 'events are append-only');
        END;
        "#,
    )?;
    Ok(())
}
