//! Error types for the sortedkv storage layer.

use std::io;

/// The result type used throughout sortedkv.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for sortedkv operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested key was not found.
    ///
    /// `get` on an absent key always returns this sentinel, never an
    /// empty value with `Ok`.
    #[error("key not found")]
    NotFound,

    /// A key exceeded [`MAX_KEY_SIZE`](crate::kv::MAX_KEY_SIZE).
    #[error("key too large ({0} bytes)")]
    KeyTooLarge(usize),

    /// A value exceeded [`MAX_VALUE_SIZE`](crate::kv::MAX_VALUE_SIZE).
    #[error("value too large ({0} bytes)")]
    ValueTooLarge(usize),

    /// The on-disk schema version does not match the required version.
    #[error(
        "schema version is {found}; required version is {required}. \
         You need to wipe and reindex this store"
    )]
    SchemaVersion {
        /// Version found on disk.
        found: i64,
        /// Version this build requires.
        required: i64,
    },

    /// The store does not support wholesale erasure.
    #[error("wipe not supported by this store")]
    WipeUnsupported,

    /// The store has already been closed.
    #[error("store is closed")]
    Closed,

    /// The store does not offer point-in-time read snapshots.
    #[error("read snapshots not supported by this store")]
    SnapshotUnsupported,

    /// No constructor registered for the requested backend type.
    #[error("unknown storage type {requested:?} (known: {})", .known.join(", "))]
    UnknownBackend {
        /// The `type` string from the configuration.
        requested: String,
        /// Names registered at the time of the lookup.
        known: Vec<String>,
    },

    /// A registered constructor failed while opening a store.
    #[error("opening {type_name:?} store: {source}")]
    Constructor {
        /// The backend type that failed to open.
        type_name: String,
        /// The constructor's error.
        #[source]
        source: Box<Error>,
    },

    /// A full index rebuild finished, but some blobs could not be
    /// indexed.
    #[error("{failed} blobs failed to reindex")]
    Reindex {
        /// Number of blobs whose rows could not be written.
        failed: usize,
    },

    /// Invalid or incomplete configuration.
    #[error("config: {0}")]
    Config(String),

    /// Stored data failed validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// An error reported by the backing storage engine.
    #[error("{backend}: {source}")]
    Backend {
        /// Backend name, e.g. `"sled"` or `"sqlite"`.
        backend: &'static str,
        /// The engine's own error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Reports whether this error is the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Creates a new corrupt-data error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Wraps a storage engine error with the backend name.
    pub fn backend(
        backend: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Backend { backend, source: Box::new(source) }
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::backend("sled", err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::backend("sqlite", err)
    }
}

impl From<redb::Error> for Error {
    fn from(err: redb::Error) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Error::backend("kvfile", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}
