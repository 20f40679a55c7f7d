//! Atomic batch mutations.
//!
//! A [`BatchMutation`] groups set and delete operations so a backend can
//! apply them all-or-nothing in one commit. The batch is a plain ordered
//! list of operations shared by every backend; it carries no backend
//! state, so a batch built against one store commits cleanly against any
//! other.
//!
//! # Example
//!
//! ```rust
//! use sortedkv::{memkv::MemKeyValue, KeyValue};
//!
//! # fn main() -> Result<(), sortedkv::Error> {
//! let kv = MemKeyValue::new();
//! let mut batch = kv.begin_batch();
//! batch.set("key1", "value1");
//! batch.set("key2", "value2");
//! batch.delete("key3");
//! kv.commit_batch(batch)?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::kv::check_sizes;

/// A single mutation within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Upsert `key` to `value`.
    Set {
        /// Key to upsert.
        key: String,
        /// Value to associate with the key.
        value: String,
    },
    /// Remove `key`.
    Delete {
        /// Key to delete.
        key: String,
    },
}

impl Mutation {
    /// The key this mutation touches.
    pub fn key(&self) -> &str {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }
}

/// An ordered sequence of mutations applied atomically on commit.
///
/// Building the batch never touches the store; only
/// [`commit_batch`](crate::kv::KeyValue::commit_batch) does. Mutations
/// apply in insertion order, so a `set` followed by a `delete` of the
/// same key leaves the key absent.
#[derive(Debug, Default)]
pub struct BatchMutation {
    mutations: Vec<Mutation>,
    approximate_size: usize,
}

impl BatchMutation {
    /// Creates a new empty batch.
    ///
    /// # Example
    ///
    /// ```
    /// use sortedkv::BatchMutation;
    ///
    /// let batch = BatchMutation::new();
    /// assert!(batch.is_empty());
    /// ```
    pub fn new() -> Self {
        Self { mutations: Vec::new(), approximate_size: 0 }
    }

    /// Queues an upsert of `key` to `value`.
    ///
    /// # Example
    ///
    /// ```
    /// use sortedkv::BatchMutation;
    ///
    /// let mut batch = BatchMutation::new();
    /// batch.set("key", "value");
    /// assert_eq!(batch.len(), 1);
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        self.approximate_size += key.len() + value.len() + 8;
        self.mutations.push(Mutation::Set { key, value });
    }

    /// Queues a removal of `key`.
    ///
    /// # Example
    ///
    /// ```
    /// use sortedkv::BatchMutation;
    ///
    /// let mut batch = BatchMutation::new();
    /// batch.delete("key");
    /// assert_eq!(batch.len(), 1);
    /// ```
    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.approximate_size += key.len() + 4;
        self.mutations.push(Mutation::Delete { key });
    }

    /// Drops all queued mutations.
    pub fn clear(&mut self) {
        self.mutations.clear();
        self.approximate_size = 0;
    }

    /// Returns the number of queued mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if no mutations are queued.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Returns the approximate in-memory size of the batch in bytes.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Validates every queued set against the store size bounds.
    ///
    /// Backends call this before applying anything, so an oversized
    /// entry fails the whole batch up front rather than mid-apply.
    pub fn check_sizes(&self) -> Result<()> {
        for m in &self.mutations {
            match m {
                Mutation::Set { key, value } => check_sizes(key, value)?,
                Mutation::Delete { .. } => {}
            }
        }
        Ok(())
    }

    /// Iterates the queued mutations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.mutations.iter()
    }

    /// Consumes the batch, yielding the mutations in insertion order.
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}
