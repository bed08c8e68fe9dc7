use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::backend::{embedded_version, CasOutcome, KvBackend};
use crate::error::Result;

/// Durable backend on a single sqlite file.
///
/// One connection behind a `Mutex`. The lock also linearises CAS writes,
/// so the check-and-replace below needs no extra transaction machinery.
/// Expiry is lazy (reads filter on `expires_at`); [`sweep_expired`]
/// physically prunes dead rows and is driven by a periodic task upstream.
///
/// [`sweep_expired`]: SqliteBackend::sweep_expired
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database file. `file_lock_timeout_ms` bounds
    /// how long sqlite waits on the database file lock.
    pub fn open(path: &str, file_lock_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(file_lock_timeout_ms))?;
        init_db(&conn)?;
        debug!(path, "sqlite backend ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory sqlite, for tests that want the real SQL paths.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete every expired row across all three tables. Returns the number
    /// of rows removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = now_secs();
        let conn = self.conn.lock().unwrap();
        let mut removed = 0;
        removed += conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now])?;
        removed += conn.execute("DELETE FROM kv_sets WHERE expires_at <= ?1", params![now])?;
        removed += conn.execute("DELETE FROM kv_lists WHERE expires_at <= ?1", params![now])?;
        Ok(removed)
    }
}

/// Initialise backend tables. Safe to call on every startup (idempotent).
fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS kv_sets (
            key        TEXT NOT NULL,
            member     TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            UNIQUE(key, member)
        );
        CREATE INDEX IF NOT EXISTS idx_kv_sets_key ON kv_sets(key);
        CREATE TABLE IF NOT EXISTS kv_lists (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_kv_lists_key ON kv_lists(key, id);",
    )
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expiry(ttl: Duration) -> i64 {
    now_secs() + ttl.as_secs() as i64
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_secs()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expiry(ttl)],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn cas(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        let conn = self.conn.lock().unwrap();

        let current = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now_secs()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(CasOutcome::Absent);
        };
        if embedded_version(&current) != Some(expected_version) {
            return Ok(CasOutcome::Conflict);
        }

        // The version guard is repeated in SQL so the write stays correct
        // even if another process shares the database file.
        let changed = conn.execute(
            "UPDATE kv SET value = ?2, expires_at = ?3
             WHERE key = ?1
               AND CAST(json_extract(value, '$.summary.version') AS INTEGER) = ?4",
            params![key, value, expiry(ttl), expected_version as i64],
        )?;

        if changed == 1 {
            Ok(CasOutcome::Ok)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let exp = expiry(ttl);
        conn.execute(
            "INSERT INTO kv_sets (key, member, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET expires_at = ?3",
            params![key, member, exp],
        )?;
        // Refresh the whole set's lifetime, not just the new member's.
        conn.execute(
            "UPDATE kv_sets SET expires_at = ?2 WHERE key = ?1",
            params![key, exp],
        )?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT member FROM kv_sets WHERE key = ?1 AND expires_at > ?2 ORDER BY member",
        )?;
        let rows = stmt
            .query_map(params![key, now_secs()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' AND expires_at > ?2 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![pattern, now_secs()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let exp = expiry(ttl);
        conn.execute(
            "INSERT INTO kv_lists (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, exp],
        )?;
        conn.execute(
            "UPDATE kv_lists SET expires_at = ?2 WHERE key = ?1",
            params![key, exp],
        )?;
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT value FROM (
                 SELECT id, value FROM kv_lists
                 WHERE key = ?1 AND expires_at > ?2
                 ORDER BY id DESC LIMIT ?3
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![key, now_secs(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE kv SET expires_at = ?2 WHERE key = ?1 AND expires_at > ?3",
            params![key, expiry(ttl), now_secs()],
        )?;
        Ok(())
    }
}
