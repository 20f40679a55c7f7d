//! Blob references and blob sources.
//!
//! A blob is an immutable chunk of bytes addressed by the SHA-256 of
//! its content, written `sha256-<64 hex digits>`. The index never
//! stores blob bytes; it reads them from a [`BlobSource`] and derives
//! rows from them. Schema blobs are JSON objects with a `type` field
//! and get richer rows than raw blobs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const HASH_PREFIX: &str = "sha256-";
const HEX_LEN: usize = 64;

/// A content-hash reference to a blob.
///
/// Ordered by its string form, so sorting refs gives a deterministic
/// enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobRef(String);

impl BlobRef {
    /// Computes the reference for a blob's bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        BlobRef(format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize())))
    }

    /// Parses and validates a reference in `sha256-<hex>` form.
    pub fn parse(s: &str) -> Result<Self> {
        let digest = s
            .strip_prefix(HASH_PREFIX)
            .ok_or_else(|| Error::corrupt(format!("invalid blob ref {:?}", s)))?;
        if digest.len() != HEX_LEN
            || !digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::corrupt(format!("invalid blob ref {:?}", s)));
        }
        Ok(BlobRef(s.to_owned()))
    }

    /// The `sha256-<hex>` string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reports whether `data` hashes to this reference.
    pub fn matches(&self, data: &[u8]) -> bool {
        BlobRef::from_bytes(data) == *self
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BlobRef::parse(s)
    }
}

/// A blob reference together with the blob's size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedBlobRef {
    /// The blob's reference.
    pub blobref: BlobRef,
    /// The blob's size in bytes.
    pub size: u64,
}

/// Something that can enumerate and fetch stored blobs.
///
/// The source is the durable copy of the data; the index is a
/// rebuildable cache over it.
pub trait BlobSource: Send + Sync {
    /// Lists every stored blob, sorted by reference.
    fn enumerate(&self) -> Result<Vec<SizedBlobRef>>;

    /// Fetches a blob's bytes.
    ///
    /// Returns [`Error::NotFound`] when the source holds no such blob.
    fn fetch(&self, br: &BlobRef) -> Result<Bytes>;
}

/// An in-memory blob source, for tests and ephemeral corpora.
#[derive(Default)]
pub struct MemBlobSource {
    blobs: RwLock<BTreeMap<BlobRef, Bytes>>,
}

impl MemBlobSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a blob, returning its computed reference.
    pub fn put(&self, data: impl Into<Bytes>) -> BlobRef {
        let data = data.into();
        let br = BlobRef::from_bytes(&data);
        self.blobs.write().insert(br.clone(), data);
        br
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Reports whether the source holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobSource for MemBlobSource {
    fn enumerate(&self) -> Result<Vec<SizedBlobRef>> {
        Ok(self
            .blobs
            .read()
            .iter()
            .map(|(br, data)| SizedBlobRef { blobref: br.clone(), size: data.len() as u64 })
            .collect())
    }

    fn fetch(&self, br: &BlobRef) -> Result<Bytes> {
        self.blobs.read().get(br).cloned().ok_or(Error::NotFound)
    }
}

/// A directory-backed blob source: one file per blob, named by its
/// reference. Usable from multiple processes at once, which the
/// interrupt-recovery tooling relies on.
pub struct DirBlobSource {
    dir: PathBuf,
}

impl DirBlobSource {
    /// Opens (or creates) a blob directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    /// Stores a blob, returning its computed reference. Writing the
    /// same blob twice is a no-op.
    pub fn put(&self, data: &[u8]) -> Result<BlobRef> {
        let br = BlobRef::from_bytes(data);
        let path = self.dir.join(br.as_str());
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok(br)
    }
}

impl BlobSource for DirBlobSource {
    fn enumerate(&self) -> Result<Vec<SizedBlobRef>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Files that are not blob refs (editor droppings, partial
            // writes under another name) are skipped, not errors.
            let Ok(br) = BlobRef::parse(name) else { continue };
            let size = entry.metadata()?.len();
            out.push(SizedBlobRef { blobref: br, size });
        }
        out.sort_by(|a, b| a.blobref.cmp(&b.blobref));
        Ok(out)
    }

    fn fetch(&self, br: &BlobRef) -> Result<Bytes> {
        match std::fs::read(self.dir.join(br.as_str())) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

/// A parsed schema blob: a JSON object whose `type` field selects the
/// kind. Blobs that fail to parse as one of these are indexed as raw
/// bytes only.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SchemaBlob {
    /// A stable anchor for attribute claims.
    #[serde(rename = "permanode")]
    Permanode {
        /// Random nonce making each permanode blob unique.
        #[serde(default)]
        random: String,
    },

    /// An attribute claim against a permanode.
    #[serde(rename = "claim")]
    Claim {
        /// Ref of the permanode being modified.
        permanode: String,
        /// Ref of the signing identity.
        signer: String,
        /// Claim time, RFC 3339.
        #[serde(rename = "claimDate")]
        claim_date: String,
        /// One of `set-attribute`, `add-attribute`, `del-attribute`.
        #[serde(rename = "claimType")]
        claim_type: String,
        /// Attribute name.
        attr: String,
        /// Attribute value.
        #[serde(default)]
        value: String,
    },

    /// File metadata.
    #[serde(rename = "file")]
    File {
        /// File name, without directory components.
        #[serde(rename = "fileName")]
        file_name: String,
        /// Byte size of the file content.
        size: u64,
        /// Declared MIME type, if known.
        #[serde(rename = "mimeType", default)]
        mime_type: String,
    },
}

impl SchemaBlob {
    /// Parses a blob's bytes as a schema blob, or `None` when the blob
    /// is not JSON of a known schema type.
    pub fn parse(data: &[u8]) -> Option<SchemaBlob> {
        serde_json::from_slice(data).ok()
    }
}

/// A best-effort MIME sniff for the meta row. Schema blobs report
/// JSON; other blobs are classified by whether they decode as UTF-8.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if SchemaBlob::parse(data).is_some() {
        return "application/json";
    }
    if std::str::from_utf8(data).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}
