//! In-memory KeyValue backend.
//!
//! Backed by a `BTreeMap` behind a read-write lock. Nothing persists;
//! this backend exists for tests and for callers that want the sorted
//! contract without a file. Registered under the type name `mem`.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::batch::{BatchMutation, Mutation};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{check_sizes, Iter, KeyValue, ReadSnapshot};

/// Constructor for the registry. Accepts no fields beyond `type`.
pub fn from_config(_cfg: &Config) -> Result<Box<dyn KeyValue>> {
    Ok(Box::new(MemKeyValue::new()))
}

/// A sorted in-memory store.
#[derive(Default)]
pub struct MemKeyValue {
    map: RwLock<BTreeMap<String, String>>,
}

impl MemKeyValue {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValue for MemKeyValue {
    fn get(&self, key: &str) -> Result<String> {
        self.map.read().get(key).cloned().ok_or(Error::NotFound)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_sizes(key, value)?;
        self.map.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        Box::new(PairsIter::new(range_pairs(&self.map.read(), start, end)))
    }

    fn commit_batch(&self, batch: BatchMutation) -> Result<()> {
        batch.check_sizes()?;
        let mut map = self.map.write();
        for m in batch.into_mutations() {
            match m {
                Mutation::Set { key, value } => {
                    map.insert(key, value);
                }
                Mutation::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        self.map.write().clear();
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn ReadSnapshot>> {
        Ok(Box::new(MemSnapshot { map: self.map.read().clone() }))
    }
}

/// A cloned point-in-time view of the tree.
struct MemSnapshot {
    map: BTreeMap<String, String>,
}

impl ReadSnapshot for MemSnapshot {
    fn get(&self, key: &str) -> Result<String> {
        self.map.get(key).cloned().ok_or(Error::NotFound)
    }

    fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
        Box::new(PairsIter::new(range_pairs(&self.map, start, end)))
    }
}

fn range_pairs(map: &BTreeMap<String, String>, start: &str, end: &str) -> Vec<(String, String)> {
    // BTreeMap::range panics on an inverted range; [start, end) with
    // end <= start is just empty.
    if !end.is_empty() && end <= start {
        return Vec::new();
    }
    let upper = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_owned())
    };
    map.range((Bound::Included(start.to_owned()), upper))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// An iterator over a materialized range.
struct PairsIter {
    pairs: std::vec::IntoIter<(String, String)>,
    current: Option<(String, String)>,
    closed: bool,
}

impl PairsIter {
    fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs: pairs.into_iter(), current: None, closed: false }
    }
}

impl Iter for PairsIter {
    fn next(&mut self) -> bool {
        assert!(!self.closed, "next called on closed iterator");
        self.current = self.pairs.next();
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
        Ok(())
    }
}
