// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable event storage. The dispatcher and the control plane only see the
//! [`Storage`] trait; the reference backing is an embedded SQLite store.

use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use vigil_common::{Error, EventKind, Protocol, Result, SecurityEvent, Severity, Timestamp};

pub const DEFAULT_MAX_EVENTS: u64 = 100_000;
/// Trim runs every this many inserts.
const TRIM_EVERY: u64 = 1000;

/// What the pipeline needs from persistence.
pub trait Storage: Send + Sync {
    fn insert(&self, event: &SecurityEvent) -> Result<()>;
    /// Most recent events first, optionally filtered by minimum severity
    /// (grade-wise: critical=1 is the most severe) and a lower timestamp
    /// bound in epoch seconds.
    fn query_recent(
        &self,
        limit: usize,
        min_severity: Option<Severity>,
        since: Option<i64>,
    ) -> Result<Vec<SecurityEvent>>;
    fn count(&self) -> Result<u64>;
    fn set_max_events(&self, max: u64);
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT,
  timestamp INTEGER,
  timestamp_usec INTEGER,
  event_type INTEGER,
  severity INTEGER,
  protocol INTEGER,
  src_ip TEXT,
  src_port INTEGER,
  dst_ip TEXT,
  dst_port INTEGER,
  signature_id INTEGER,
  signature_rev INTEGER,
  signature_msg TEXT,
  classification TEXT,
  interface TEXT,
  created_at INTEGER DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_events_severity ON events(severity);
CREATE INDEX IF NOT EXISTS idx_events_signature ON events(signature_id);
";

const INSERT_SQL: &str = "
INSERT INTO events (
  event_id, timestamp, timestamp_usec, event_type, severity, protocol,
  src_ip, src_port, dst_ip, dst_port,
  signature_id, signature_rev, signature_msg
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);
";

const SELECT_COLUMNS: &str = "
  event_id, timestamp, timestamp_usec, event_type, severity, protocol,
  src_ip, src_port, dst_ip, dst_port, signature_id, signature_rev, signature_msg
";

/// SQLite-backed store. All operations serialize on the connection lock;
/// counters are atomic so stats reads never contend with inserts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_events: AtomicU64,
    inserted: AtomicU64,
    deleted: AtomicU64,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Db(e.to_string())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err)?;

        // WAL keeps the dispatcher's inserts from blocking control-plane
        // reads; NORMAL sync is the usual durability/throughput balance.
        // journal_mode reports the resulting mode as a row, so query it.
        if let Err(e) = conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(())) {
            warn!(error = %e, "failed to enable WAL mode");
        }
        if let Err(e) = conn.execute_batch("PRAGMA synchronous=NORMAL;") {
            warn!(error = %e, "failed to set synchronous mode");
        }

        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        info!(path = %path.display(), "event storage opened");

        Ok(SqliteStore {
            conn: Mutex::new(conn),
            max_events: AtomicU64::new(DEFAULT_MAX_EVENTS),
            inserted: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            max_events: AtomicU64::new(DEFAULT_MAX_EVENTS),
            inserted: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        })
    }

    /// (inserted, deleted) over this store's lifetime.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.inserted.load(Ordering::Relaxed),
            self.deleted.load(Ordering::Relaxed),
        )
    }

    fn trim_if_needed(&self, conn: &Connection) {
        let max = self.max_events.load(Ordering::Relaxed);
        let count: i64 = match conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)) {
            Ok(count) => count,
            Err(_) => return,
        };
        if count <= max as i64 {
            return;
        }
        let to_delete = count - max as i64;
        match conn.execute(
            "DELETE FROM events WHERE id IN (
               SELECT id FROM events ORDER BY timestamp ASC, id ASC LIMIT ?1
             )",
            [to_delete],
        ) {
            Ok(deleted) => {
                self.deleted.fetch_add(deleted as u64, Ordering::Relaxed);
                debug!(deleted, "trimmed old events");
            }
            Err(e) => warn!(error = %e, "event trim failed"),
        }
    }
}

impl Storage for SqliteStore {
    fn insert(&self, event: &SecurityEvent) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::Generic)?;
        let mut stmt = conn.prepare_cached(INSERT_SQL).map_err(db_err)?;
        stmt.execute(rusqlite::params![
            event.id,
            event.timestamp.sec,
            event.timestamp.usec,
            event.kind as u8,
            event.severity.grade(),
            event.protocol as u8,
            event.src_addr,
            event.src_port,
            event.dst_addr,
            event.dst_port,
            event.rule_sid,
            event.rule_gid,
            event.message,
        ])
        .map_err(db_err)?;
        drop(stmt);

        let inserted = self.inserted.fetch_add(1, Ordering::Relaxed) + 1;
        if inserted % TRIM_EVERY == 0 {
            self.trim_if_needed(&conn);
        }
        Ok(())
    }

    fn query_recent(
        &self,
        limit: usize,
        min_severity: Option<Severity>,
        since: Option<i64>,
    ) -> Result<Vec<SecurityEvent>> {
        let conn = self.conn.lock().map_err(|_| Error::Generic)?;

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM events WHERE 1=1");
        let mut params: Vec<i64> = Vec::new();
        if let Some(severity) = min_severity {
            params.push(severity.grade() as i64);
            sql.push_str(&format!(" AND severity <= ?{}", params.len()));
        }
        if let Some(since) = since {
            params.push(since);
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        params.push(limit as i64);
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
            params.len()
        ));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok(SecurityEvent {
                    id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    timestamp: Timestamp {
                        sec: row.get(1)?,
                        usec: row.get(2)?,
                    },
                    kind: EventKind::from_u8(row.get(3)?).unwrap_or(EventKind::Alert),
                    severity: Severity::from_grade(row.get(4)?).unwrap_or(Severity::Info),
                    protocol: Protocol::from_u8(row.get(5)?).unwrap_or(Protocol::Unknown),
                    src_addr: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    src_port: row.get(7)?,
                    dst_addr: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                    dst_port: row.get(9)?,
                    rule_sid: row.get(10)?,
                    rule_gid: row.get(11)?,
                    message: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
                    metadata: None,
                })
            })
            .map_err(db_err)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(db_err)?);
        }
        Ok(events)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().map_err(|_| Error::Generic)?;
        conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get::<_, i64>(0))
            .map(|c| c as u64)
            .map_err(db_err)
    }

    fn set_max_events(&self, max: u64) {
        self.max_events.store(max.max(1), Ordering::Relaxed);
    }
}
