//! The sorted key-value store abstraction.
//!
//! Every backend implements [`KeyValue`]: a durable mapping from string
//! keys to string values with byte-lexicographic ordering, ranged
//! iteration, and atomic batched mutation. Callers pick a backend at
//! construction time through the [`Registry`](crate::registry::Registry)
//! and only ever hold a `Box<dyn KeyValue>`.

use crate::batch::BatchMutation;
use crate::error::{Error, Result};

/// Maximum accepted key length in bytes.
///
/// Sized to stay under common relational engine index limits so the
/// SQL-backed implementation stays viable with the same inputs.
pub const MAX_KEY_SIZE: usize = 767;

/// Maximum accepted value length in bytes.
pub const MAX_VALUE_SIZE: usize = 63000;

/// Validates a key/value pair against the size bounds.
///
/// All backends call this before any write, so every store rejects the
/// same inputs identically. Oversize is always a hard error, never a
/// silent skip.
pub fn check_sizes(key: &str, value: &str) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge(key.len()));
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(Error::ValueTooLarge(value.len()));
    }
    Ok(())
}

/// An ordered cursor over a key range.
///
/// The current entry is valid only between a [`next`](Iter::next) that
/// returned `true` and the following `next`/`close` call. Iterators own
/// their position and any backend resources; they must be closed to
/// release those resources and to observe any deferred backend error.
///
/// Calling `next` after `close` panics.
pub trait Iter: Send {
    /// Advances to the next entry, returning `false` at the end of the
    /// range (or when a backend error interrupts iteration; the error
    /// itself is reported by [`close`](Iter::close)).
    fn next(&mut self) -> bool;

    /// The current key.
    ///
    /// # Panics
    ///
    /// Panics when there is no current entry.
    fn key(&self) -> &str;

    /// The current value.
    ///
    /// # Panics
    ///
    /// Panics when there is no current entry.
    fn value(&self) -> &str;

    /// Releases backend resources and returns any error that ended
    /// iteration early.
    fn close(&mut self) -> Result<()>;
}

/// A consistent point-in-time read view, isolated from concurrent
/// writers. Offered by backends whose engine supports it; see
/// [`KeyValue::snapshot`].
pub trait ReadSnapshot: Send {
    /// Reads a key from the snapshot.
    fn get(&self, key: &str) -> Result<String>;

    /// Ordered iteration over `[start, end)` as of the snapshot.
    fn find(&self, start: &str, end: &str) -> Box<dyn Iter>;
}

/// A sorted, durable key-value store.
///
/// Keys order byte-lexicographically. All methods may block on disk
/// I/O; callers should treat them as synchronous, potentially slow
/// calls and not hold unrelated locks across them.
///
/// # Example
///
/// ```rust
/// use sortedkv::{memkv::MemKeyValue, Iter, KeyValue};
///
/// # fn main() -> Result<(), sortedkv::Error> {
/// let kv = MemKeyValue::new();
/// kv.set("greeting", "hello")?;
/// assert_eq!(kv.get("greeting")?, "hello");
///
/// let mut it = kv.find("a", "");
/// while it.next() {
///     println!("{} = {}", it.key(), it.value());
/// }
/// it.close()?;
/// # Ok(())
/// # }
/// ```
pub trait KeyValue: Send + Sync {
    /// Returns the value for `key`, or [`Error::NotFound`] if absent.
    fn get(&self, key: &str) -> Result<String>;

    /// Upserts `key` to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] / [`Error::ValueTooLarge`] when
    /// the inputs exceed the documented bounds, before any write.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Ordered iteration over keys `k` with `k >= start` and, when
    /// `end` is non-empty, `k < end`. An empty `end` means unbounded.
    ///
    /// Never fails synchronously; errors surface through the returned
    /// iterator's `close`.
    fn find(&self, start: &str, end: &str) -> Box<dyn Iter>;

    /// Starts an empty batch of mutations.
    ///
    /// Building the batch never touches the store; only
    /// [`commit_batch`](KeyValue::commit_batch) does.
    fn begin_batch(&self) -> BatchMutation {
        BatchMutation::new()
    }

    /// Atomically applies every mutation in `batch`.
    ///
    /// All-or-nothing: on any failure no mutation from the batch is
    /// observable. Sizes are validated for the whole batch before the
    /// first write.
    fn commit_batch(&self, batch: BatchMutation) -> Result<()>;

    /// Releases file handles and connections.
    ///
    /// Safe to call once per store; calling it twice is
    /// backend-defined but never crashes the process.
    fn close(&self) -> Result<()>;

    /// Erases every row and reinitializes the store in place.
    ///
    /// Backends that cannot support this keep the default, which
    /// returns [`Error::WipeUnsupported`].
    fn wipe(&self) -> Result<()> {
        Err(Error::WipeUnsupported)
    }

    /// Opens a consistent point-in-time read view.
    ///
    /// Backends without engine support keep the default, which returns
    /// [`Error::SnapshotUnsupported`].
    fn snapshot(&self) -> Result<Box<dyn ReadSnapshot>> {
        Err(Error::SnapshotUnsupported)
    }
}

impl std::fmt::Debug for dyn KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn KeyValue")
    }
}

/// Drains `find(start, end)` into owned pairs, closing the iterator
/// and propagating any deferred error.
pub fn collect_range(kv: &dyn KeyValue, start: &str, end: &str) -> Result<Vec<(String, String)>> {
    let mut it = kv.find(start, end);
    let mut out = Vec::new();
    while it.next() {
        out.push((it.key().to_owned(), it.value().to_owned()));
    }
    it.close()?;
    Ok(out)
}

/// An iterator that yields nothing and reports a stored error on close.
///
/// Used by backends to satisfy "`find` never fails synchronously" when
/// the range query itself cannot be started.
pub(crate) struct ErrIter {
    err: Option<Error>,
    closed: bool,
}

impl ErrIter {
    pub(crate) fn new(err: Error) -> Self {
        ErrIter { err: Some(err), closed: false }
    }
}

impl Iter for ErrIter {
    fn next(&mut self) -> bool {
        assert!(!self.closed, "next called on closed iterator");
        false
    }

    fn key(&self) -> &str {
        panic!("no current entry");
    }

    fn value(&self) -> &str {
        panic!("no current entry");
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
