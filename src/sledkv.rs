//! sled-backed KeyValue backend.
//!
//! An embedded LSM-style ordered store over a directory. Registered
//! under the type name `sled`.
//!
//! Writes are not fsynced individually: the engine's periodic
//! background flush is the only durability. On machine crash the index
//! is expected to be rebuilt from the blob source, which is the durable
//! copy of the data.

use std::path::Path;

use crate::batch::{BatchMutation, Mutation};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{check_sizes, Iter, KeyValue};

/// Constructor for the registry.
///
/// Fields: `file` (required) — directory path; `cache_size` (optional)
/// — engine cache capacity in bytes.
pub fn from_config(cfg: &Config) -> Result<Box<dyn KeyValue>> {
    let file = cfg.required_string("file");
    let cache_size = cfg.optional_int("cache_size", 0);
    if file.is_empty() {
        cfg.validate()?;
        return Err(Error::config("empty \"file\" field"));
    }

    let mut builder = sled::Config::new().path(&file);
    if cache_size > 0 {
        builder = builder.cache_capacity(cache_size as u64);
    }
    let db = builder.open()?;
    log::debug!("opened sled store at {:?}", file);
    Ok(Box::new(SledKeyValue { db }))
}

/// A sorted store over a sled tree.
pub struct SledKeyValue {
    db: sled::Db,
}

impl SledKeyValue {
    /// Opens (or creates) a store in the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

fn decode(bytes: sled::IVec) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::corrupt("non-UTF-8 data in sled tree"))
}

impl KeyValue for SledKeyValue {
    fn get(&self, key: &str) -> Result<String> {
        match self.db.get(key.as_bytes())? {
            Some(v) => decode(v),
            None => Err(Error::NotFound),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        let inner = if end.is_empty() {
            self.db.range(start.as_bytes()..)
        } else {
            self.db.range(start.as_bytes()..end.as_bytes())
        };
        Box::new(SledIter { inner, current: None, err: None, closed: false })
    }

    fn commit_batch(&self, batch: BatchMutation) -> Result<()> {
        batch.check_sizes()?;
        let mut native = sled::Batch::default();
        for m in batch.into_mutations() {
            match m {
                Mutation::Set { key, value } => native.insert(key.as_bytes(), value.as_bytes()),
                Mutation::Delete { key } => native.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(native)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

struct SledIter {
    inner: sled::Iter,
    current: Option<(String, String)>,
    err: Option<Error>,
    closed: bool,
}

impl Iter for SledIter {
    fn next(&mut self) -> bool {
        assert!(!self.closed, "next called on closed iterator");
        if self.err.is_some() {
            return false;
        }
        match self.inner.next() {
            Some(Ok((k, v))) => match (decode(k), decode(v)) {
                (Ok(key), Ok(value)) => {
                    self.current = Some((key, value));
                    true
                }
                (Err(e), _) | (_, Err(e)) => {
                    self.err = Some(e);
                    self.current = None;
                    false
                }
            },
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::collect_range;
    use tempfile::TempDir;

    #[test]
    fn test_sled_round_trip() {
        let dir = TempDir::new().unwrap();
        let kv = SledKeyValue::open(dir.path()).unwrap();
        kv.set("foo", "bar").unwrap();
        assert_eq!(kv.get("foo").unwrap(), "bar");
        assert!(kv.get("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_sled_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = SledKeyValue::open(dir.path()).unwrap();
            kv.set("persist", "yes").unwrap();
            kv.close().unwrap();
        }
        {
            let kv = SledKeyValue::open(dir.path()).unwrap();
            assert_eq!(kv.get("persist").unwrap(), "yes");
        }
    }

    #[test]
    fn test_sled_batch_applies_atomically() {
        let dir = TempDir::new().unwrap();
        let kv = SledKeyValue::open(dir.path()).unwrap();
        kv.set("stale", "old").unwrap();

        let mut batch = kv.begin_batch();
        batch.set("a", "1");
        batch.set("b", "2");
        batch.delete("stale");
        kv.commit_batch(batch).unwrap();

        assert_eq!(kv.get("a").unwrap(), "1");
        assert_eq!(kv.get("b").unwrap(), "2");
        assert!(kv.get("stale").unwrap_err().is_not_found());
    }

    #[test]
    fn test_sled_find_range() {
        let dir = TempDir::new().unwrap();
        let kv = SledKeyValue::open(dir.path()).unwrap();
        for k in ["a", "b", "c", "d"] {
            kv.set(k, k).unwrap();
        }
        let keys: Vec<String> =
            collect_range(&kv, "b", "d").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_sled_wipe() {
        let dir = TempDir::new().unwrap();
        let kv = SledKeyValue::open(dir.path()).unwrap();
        kv.set("a", "1").unwrap();
        kv.wipe().unwrap();
        assert!(collect_range(&kv, "", "").unwrap().is_empty());
        kv.set("b", "2").unwrap();
        assert_eq!(kv.get("b").unwrap(), "2");
    }

    #[test]
    fn test_sled_snapshot_unsupported() {
        let dir = TempDir::new().unwrap();
        let kv = SledKeyValue::open(dir.path()).unwrap();
        assert!(matches!(kv.snapshot(), Err(Error::SnapshotUnsupported)));
    }
}
