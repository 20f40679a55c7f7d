//! SQLite-backed KeyValue backend.
//!
//! One database file with two tables: `rows(k PRIMARY KEY, v)` holds
//! the data and `meta(metakey PRIMARY KEY, value)` holds bookkeeping,
//! including the schema `version` row validated on open. Registered
//! under the type name `sqlite`.
//!
//! All access goes through one connection behind a mutex; SQLite is the
//! only backend that needs this serialization. Write-Ahead Logging is
//! enabled when the linked library supports it (3.7.0+). Without WAL,
//! concurrent read/write load is likely to fail with busy errors, so
//! its absence is logged loudly.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::batch::{BatchMutation, Mutation};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{check_sizes, Iter, KeyValue};
use crate::SCHEMA_VERSION;

/// Rows fetched per chunk during iteration.
const FETCH_CHUNK: usize = 256;

/// Constructor for the registry.
///
/// Fields: `file` (required) — database file path.
pub fn from_config(cfg: &Config) -> Result<Box<dyn KeyValue>> {
    let file = cfg.required_string("file");
    if file.is_empty() {
        cfg.validate()?;
        return Err(Error::config("empty \"file\" field"));
    }
    Ok(Box::new(SqliteKeyValue::open(file)?))
}

/// A sorted store over a SQLite database file.
pub struct SqliteKeyValue {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteKeyValue {
    /// Opens (or creates) a store at the given file path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaVersion`] when the file carries a schema
    /// version other than the required one; the operator must wipe and
    /// reindex rather than run with stale schema assumptions.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let mut conn = Connection::open_with_flags(path.as_ref(), flags)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        if rusqlite::version_number() >= 3_007_000 {
            let mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                log::warn!(
                    "could not enable WAL (journal_mode is {:?}); \
                     concurrent access will likely fail under load",
                    mode
                );
            }
        } else {
            log::warn!(
                "SQLite {} is too old for WAL; concurrent access will likely fail under load",
                rusqlite::version()
            );
        }

        initialize_schema(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(Error::Closed),
        }
    }
}

/// Creates the tables if absent and validates the schema version.
fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS rows (k TEXT PRIMARY KEY, v TEXT);
         CREATE TABLE IF NOT EXISTS meta (metakey TEXT PRIMARY KEY, value TEXT);",
    )?;

    let version: Option<String> = tx
        .query_row("SELECT value FROM meta WHERE metakey = 'version'", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            let populated: i64 = tx.query_row("SELECT COUNT(*) FROM rows", [], |row| row.get(0))?;
            if populated != 0 {
                return Err(Error::corrupt(
                    "store has data but no schema version row; reinitialize it",
                ));
            }
            tx.execute(
                "REPLACE INTO meta (metakey, value) VALUES ('version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(text) => {
            let found: i64 = text
                .parse()
                .map_err(|_| Error::corrupt(format!("malformed schema version {:?}", text)))?;
            if found != SCHEMA_VERSION {
                return Err(Error::SchemaVersion { found, required: SCHEMA_VERSION });
            }
        }
    }
    tx.commit()?;
    Ok(())
}

impl KeyValue for SqliteKeyValue {
    fn get(&self, key: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT v FROM rows WHERE k = ?1", params![key], |row| row.get(0))
                .optional()?
                .ok_or(Error::NotFound)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.with_conn(|conn| {
            conn.execute("REPLACE INTO rows (k, v) VALUES (?1, ?2)", params![key, value])?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM rows WHERE k = ?1", params![key])?;
            Ok(())
        })
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        Box::new(SqliteIter {
            conn: Arc::clone(&self.conn),
            pos: Pos::First(start.to_owned()),
            end: if end.is_empty() { None } else { Some(end.to_owned()) },
            buf: VecDeque::new(),
            exhausted: false,
            current: None,
            err: None,
            closed: false,
        })
    }

    fn commit_batch(&self, batch: BatchMutation) -> Result<()> {
        batch.check_sizes()?;
        self.with_conn(|conn| {
            // Dropping the transaction without commit rolls it back, so
            // a failure mid-batch leaves no mutation applied.
            let tx = conn.transaction()?;
            for m in batch.iter() {
                match m {
                    Mutation::Set { key, value } => {
                        tx.execute(
                            "REPLACE INTO rows (k, v) VALUES (?1, ?2)",
                            params![key, value],
                        )?;
                    }
                    Mutation::Delete { key } => {
                        tx.execute("DELETE FROM rows WHERE k = ?1", params![key])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        // The schema (and its version row) survives a wipe; only data
        // rows are erased.
        self.with_conn(|conn| {
            conn.execute("DELETE FROM rows", [])?;
            Ok(())
        })
    }
}

enum Pos {
    /// Next fill starts at `k >= start`.
    First(String),
    /// Next fill continues at `k > last`.
    After(String),
}

/// Iterates by re-querying bounded chunks, so it owns no statement and
/// holds no lock between advances.
struct SqliteIter {
    conn: Arc<Mutex<Option<Connection>>>,
    pos: Pos,
    end: Option<String>,
    buf: VecDeque<(String, String)>,
    exhausted: bool,
    current: Option<(String, String)>,
    err: Option<Error>,
    closed: bool,
}

impl SqliteIter {
    fn fill(&mut self) -> Result<()> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(Error::Closed)?;

        let limit = FETCH_CHUNK as i64;
        let fetched = match (&self.pos, &self.end) {
            (Pos::First(start), Some(end)) => query_chunk(
                conn,
                "SELECT k, v FROM rows WHERE k >= ?1 AND k < ?2 ORDER BY k LIMIT ?3",
                params![start, end, limit],
            )?,
            (Pos::First(start), None) => query_chunk(
                conn,
                "SELECT k, v FROM rows WHERE k >= ?1 ORDER BY k LIMIT ?2",
                params![start, limit],
            )?,
            (Pos::After(last), Some(end)) => query_chunk(
                conn,
                "SELECT k, v FROM rows WHERE k > ?1 AND k < ?2 ORDER BY k LIMIT ?3",
                params![last, end, limit],
            )?,
            (Pos::After(last), None) => query_chunk(
                conn,
                "SELECT k, v FROM rows WHERE k > ?1 ORDER BY k LIMIT ?2",
                params![last, limit],
            )?,
        };

        if fetched.len() < FETCH_CHUNK {
            self.exhausted = true;
        }
        if let Some((last_key, _)) = fetched.last() {
            self.pos = Pos::After(last_key.clone());
        }
        self.buf.extend(fetched);
        Ok(())
    }
}

fn query_chunk(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl Iter for SqliteIter {
    fn next(&mut self) -> bool {
        assert!(!self.closed, "next called on closed iterator");
        if self.err.is_some() {
            return false;
        }
        if self.buf.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.err = Some(e);
                self.current = None;
                return false;
            }
        }
        self.current = self.buf.pop_front();
        self.current.is_some()
    }

    fn key(&self) -> &str {
        &self.current.as_ref().expect("no current entry").0
    }

    fn value(&self) -> &str {
        &self.current.as_ref().expect("no current entry").1
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.current = None;
        self.buf.clear();
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
