//! # sortedkv - Pluggable Sorted Key-Value Storage with a Rebuildable Blob Index
//!
//! sortedkv provides one contract for ordered string-to-string storage,
//! several interchangeable disk backends behind it, and an index engine
//! that treats whatever backend you picked as a disposable cache of
//! rows derived from content-addressed blobs.
//!
//! ## Architecture
//!
//! The crate consists of several key components:
//!
//! - **KeyValue**: The sorted store contract - get/set/delete, ranged
//!   iteration, atomic batches
//! - **Backends**: `mem`, `sled`, `sqlite`, and `kvfile` implementations
//!   of the contract
//! - **Registry**: Opens a backend from a JSON configuration's `type` tag
//! - **BatchMutation**: A backend-neutral description of an atomic
//!   multi-key commit
//! - **Index**: Derives searchable rows from blobs and rebuilds them all
//!   from scratch after any crash or schema change
//!
//! ## Example Usage
//!
//! ```rust
//! use sortedkv::{Config, Iter, KeyValue, Registry};
//!
//! # fn main() -> Result<(), sortedkv::Error> {
//! // Pick a backend by configuration
//! let registry = Registry::with_default_backends();
//! let config = Config::parse(r#"{"type": "mem"}"#)?;
//! let kv = registry.open(&config)?;
//!
//! // Write and read back
//! kv.set("greeting", "hello")?;
//! assert_eq!(kv.get("greeting")?, "hello");
//!
//! // Ordered iteration over [start, end)
//! let mut it = kv.find("a", "");
//! while it.next() {
//!     println!("{} = {}", it.key(), it.value());
//! }
//! it.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod batch;
pub mod blob;
pub mod config;
pub mod error;
pub mod index;
pub mod kv;
pub mod kvfile;
pub mod memkv;
pub mod registry;
pub mod sledkv;
pub mod sqlitekv;

// Re-exports
pub use batch::{BatchMutation, Mutation};
pub use config::Config;
pub use error::{Error, Result};
pub use kv::{check_sizes, collect_range, Iter, KeyValue, ReadSnapshot};
pub use kv::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use registry::Registry;

/// Version of the index row schema.
///
/// Incremented whenever any row type changes shape. Stores stamped with
/// a different version are refused at open until wiped and reindexed;
/// the `sqlite` backend additionally records it in its `meta` table.
pub const SCHEMA_VERSION: i64 = 5;
