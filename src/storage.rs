use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::proxy::{Proxy, STATUS_NEED_SCAN};

const PROXY_COLUMNS: &str = "host, port, protocol, country, source, score, status, \
     username, password, last_check, check_number, \
     avg_ping_timing, avg_request_timing, avg_response_timing, created_at";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS proxies (
    host                TEXT NOT NULL,
    port                TEXT NOT NULL,
    protocol            TEXT NOT NULL DEFAULT '',
    country             TEXT NOT NULL DEFAULT '',
    source              TEXT NOT NULL DEFAULT '',
    score               INTEGER NOT NULL DEFAULT 0,
    status              INTEGER NOT NULL DEFAULT 0,
    username            TEXT NOT NULL DEFAULT '',
    password            TEXT NOT NULL DEFAULT '',
    last_check          TEXT NOT NULL,
    check_number        INTEGER NOT NULL DEFAULT 0,
    avg_ping_timing     INTEGER NOT NULL DEFAULT 0,
    avg_request_timing  INTEGER NOT NULL DEFAULT 0,
    avg_response_timing INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    PRIMARY KEY (host, port)
);
CREATE INDEX IF NOT EXISTS idx_proxies_protocol   ON proxies(protocol);
CREATE INDEX IF NOT EXISTS idx_proxies_country    ON proxies(country);
CREATE INDEX IF NOT EXISTS idx_proxies_last_check ON proxies(last_check);
";

/// SQLite-backed proxy store. All access goes through one connection behind
/// a process-wide mutex: crawler upserts interleave with validator updates.
///
/// Timestamps are stored as fixed-width RFC3339 UTC text so lexicographic
/// order is chronological; timings are stored as integer nanoseconds.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open the on-disk store, creating the schema if needed.
    pub fn open(path: &str) -> Result<Storage> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open proxy store at {path}"))?;
        conn.execute_batch(SCHEMA)
            .context("failed to create proxy store schema")?;
        Ok(Storage {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Storage> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Storage {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert by (host, port): first sight inserts, later saves overwrite
    /// every mutable field. `created_at` keeps its first-sight value.
    pub fn save(&self, proxy: &Proxy) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO proxies
             (host, port, protocol, country, source, score, status,
              username, password, last_check, check_number,
              avg_ping_timing, avg_request_timing, avg_response_timing, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
             ON CONFLICT(host, port) DO UPDATE SET
                 protocol = excluded.protocol,
                 country = excluded.country,
                 source = excluded.source,
                 score = excluded.score,
                 status = excluded.status,
                 username = excluded.username,
                 password = excluded.password,
                 last_check = excluded.last_check,
                 check_number = excluded.check_number,
                 avg_ping_timing = excluded.avg_ping_timing,
                 avg_request_timing = excluded.avg_request_timing,
                 avg_response_timing = excluded.avg_response_timing",
            params![
                proxy.host,
                proxy.port,
                proxy.protocol,
                proxy.country,
                proxy.source,
                proxy.score,
                proxy.status,
                proxy.username,
                proxy.password,
                fmt_ts(proxy.last_check),
                proxy.check_number,
                duration_nanos(proxy.avg_ping_timing),
                duration_nanos(proxy.avg_request_timing),
                duration_nanos(proxy.avg_response_timing),
                fmt_ts(proxy.created_at),
            ],
        )?;
        Ok(())
    }

    /// Up to `n` proxies due for validation: last_check older than one hour
    /// and not parked in NEED_SCAN, oldest first.
    pub fn load_validation_bunch(&self, n: usize) -> Result<Vec<Proxy>> {
        let cutoff = fmt_ts(Utc::now() - chrono::Duration::hours(1));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies
             WHERE last_check < ?1 AND status != ?2
             ORDER BY last_check ASC
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![cutoff, STATUS_NEED_SCAN, n as i64], row_to_proxy)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Retained read API: negative-score proxies, least negative first.
    pub fn load_best(&self) -> Result<Vec<Proxy>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies
             WHERE score < 0
             ORDER BY score DESC"
        ))?;
        let rows = stmt
            .query_map([], row_to_proxy)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Point lookup by identity.
    pub fn find(&self, host: &str, port: &str) -> Result<Option<Proxy>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE host = ?1 AND port = ?2"),
                params![host, port],
                row_to_proxy,
            )
            .optional()?;
        Ok(row)
    }
}

fn row_to_proxy(row: &Row<'_>) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        host: row.get(0)?,
        port: row.get(1)?,
        protocol: row.get(2)?,
        country: row.get(3)?,
        source: row.get(4)?,
        score: row.get(5)?,
        status: row.get(6)?,
        username: row.get(7)?,
        password: row.get(8)?,
        last_check: parse_ts(&row.get::<_, String>(9)?),
        check_number: row.get(10)?,
        avg_ping_timing: nanos_duration(row.get(11)?),
        avg_request_timing: nanos_duration(row.get(12)?),
        avg_response_timing: nanos_duration(row.get(13)?),
        created_at: parse_ts(&row.get::<_, String>(14)?),
    })
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn duration_nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}

fn nanos_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}
