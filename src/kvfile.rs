//! Single-file transactional KeyValue backend.
//!
//! Backed by redb: one file, one `rows` table, MVCC transactions.
//! Registered under the type name `kvfile`.
//!
//! Batch commits run inside a single write transaction and the whole
//! transaction is abandoned on any failure, so readers never observe a
//! partial batch. A store-wide mutex serializes batch committers; that
//! trades write concurrency for keeping the embedded engine's
//! transactional behavior easy to reason about. `wipe` closes the
//! file, deletes it, and recreates an empty store in place.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadOnlyTable, TableDefinition};

use crate::batch::{BatchMutation, Mutation};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{check_sizes, ErrIter, Iter, KeyValue, ReadSnapshot};

const TABLE: TableDefinition<&'static str, &'static str> = TableDefinition::new("rows");

/// Constructor for the registry.
///
/// Fields: `file` (required) — database file path.
pub fn from_config(cfg: &Config) -> Result<Box<dyn KeyValue>> {
    let file = cfg.required_string("file");
    if file.is_empty() {
        cfg.validate()?;
        return Err(Error::config("empty \"file\" field"));
    }
    Ok(Box::new(FileKeyValue::open(file)?))
}

/// A sorted store over a single redb file.
pub struct FileKeyValue {
    path: PathBuf,
    db: RwLock<Option<Database>>,
    // Serializes commit_batch callers against each other.
    commit_mutex: Mutex<()>,
}

impl FileKeyValue {
    /// Opens (or creates) a store at the given file path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = create_db(&path)?;
        Ok(Self { path, db: RwLock::new(Some(db)), commit_mutex: Mutex::new(()) })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(Error::Closed),
        }
    }
}

/// Opens the database file and materializes the rows table, so later
/// read transactions never see a missing table.
fn create_db(path: &Path) -> Result<Database> {
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    {
        txn.open_table(TABLE)?;
    }
    txn.commit()?;
    Ok(db)
}

impl KeyValue for FileKeyValue {
    fn get(&self, key: &str) -> Result<String> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(TABLE)?;
            match table.get(key)? {
                Some(guard) => Ok(guard.value().to_owned()),
                None => Err(Error::NotFound),
            }
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                table.insert(key, value)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                table.remove(key)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        let table = match self.with_db(|db| {
            let txn = db.begin_read()?;
            Ok(txn.open_table(TABLE)?)
        }) {
            Ok(table) => table,
            Err(err) => return Box::new(ErrIter::new(err)),
        };
        range_iter(&table, start, end)
    }

    fn commit_batch(&self, batch: BatchMutation) -> Result<()> {
        batch.check_sizes()?;
        let _commit_guard = self.commit_mutex.lock();
        self.with_db(|db| {
            // An uncommitted transaction is abandoned on drop, so a
            // failure mid-batch leaves no mutation applied.
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                for m in batch.iter() {
                    match m {
                        Mutation::Set { key, value } => {
                            table.insert(key.as_str(), value.as_str())?;
                        }
                        Mutation::Delete { key } => {
                            table.remove(key.as_str())?;
                        }
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.write();
        guard.take();
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_none() {
            return Err(Error::Closed);
        }
        // Close, delete, recreate with identical options. Swapping
        // under the write lock keeps the store usable afterward.
        *guard = None;
        std::fs::remove_file(&self.path)?;
        *guard = Some(create_db(&self.path)?);
        log::info!("wiped kvfile store at {:?}", self.path);
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn ReadSnapshot>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(TABLE)?;
            Ok(Box::new(FileSnapshot { table }) as Box<dyn ReadSnapshot>)
        })
    }
}

/// A point-in-time view backed by an MVCC read transaction.
struct FileSnapshot {
    table: ReadOnlyTable<&'static str, &'static str>,
}

impl ReadSnapshot for FileSnapshot {
    fn get(&self, key: &str) -> Result<String> {
        match self.table.get(key)? {
            Some(guard) => Ok(guard.value().to_owned()),
            None => Err(Error::NotFound),
        }
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        range_iter(&self.table, start, end)
    }
}

fn range_iter(
    table: &ReadOnlyTable<&'static str, &'static str>,
    start: &str,
    end: &str,
) -> Box<dyn Iter> {
    let range = if end.is_empty() {
        table.range(start..)
    } else {
        table.range(start..end)
    };
    match range {
        Ok(inner) => Box::new(FileIter { inner, current: None, err: None, closed: false }),
        Err(err) => Box::new(ErrIter::new(err.into())),
    }
}

struct FileIter {
    inner: redb::Range<'static, &'static str, &'static str>,
    current: Option<(String, String)>,
    err: Option<Error>,
    closed: bool,
}

impl Iter for FileIter {
    fn next(&mut self) -> bool {
        assert!(!self.closed, "next called on closed iterator");
        if self.err.is_some() {
            return false;
        }
        match self.inner.next() {
            Some(Ok((k, v))) => {
                self.current = Some((k.value().to_owned(), v.value().to_owned()));
                true
            }
            Some(Err(e)) => {
                self.err = Some(e.into());
                self.current = None;
                false
            }
            None => {
                self.current = None;
                false
            }
        }
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
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
