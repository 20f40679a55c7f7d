//! The blob index engine.
//!
//! An [`Index`] derives searchable rows from the blobs of a
//! [`BlobSource`] and keeps them in any [`KeyValue`] store. The rows
//! are a cache: the source holds the durable data, and a corrupted or
//! out-of-date row store is recovered by [`Index::reindex`], which
//! wipes the store and rebuilds every row from the source. Incremental
//! indexing and the rebuild share one code path, so a rebuild can be
//! killed at any instant and the next rebuild starts from a clean wipe
//! with nothing left to reconcile.

pub mod keys;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::BatchMutation;
use crate::blob::{BlobRef, BlobSource, SchemaBlob};
use crate::error::{Error, Result};
use crate::kv::{collect_range, Iter, KeyValue};
use crate::SCHEMA_VERSION;

/// Worker threads used by a full rebuild.
const REINDEX_WORKERS: usize = 4;

/// Bound on the rebuild's blob queue, to keep enumeration from racing
/// far ahead of row writing.
const REINDEX_QUEUE_CAP: usize = 32;

/// Size and MIME type recorded for one indexed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    /// The blob's reference.
    pub blobref: BlobRef,
    /// The blob's size in bytes.
    pub size: u64,
    /// Sniffed MIME type.
    pub mime: String,
}

/// Metadata recorded for a file schema blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Declared file size in bytes.
    pub size: u64,
    /// File name, without directory components.
    pub file_name: String,
    /// Declared MIME type, possibly empty.
    pub mime_type: String,
}

/// The index engine: a row store plus the blob source the rows are
/// derived from.
pub struct Index {
    kv: Arc<dyn KeyValue>,
    source: Arc<dyn BlobSource>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

impl Index {
    /// Opens an index over an existing row store, refusing stores
    /// whose rows were built by a different schema version.
    ///
    /// An empty store is stamped with the current version. A store
    /// with rows but no version row is treated as corrupt.
    ///
    /// # Errors
    ///
    /// [`Error::SchemaVersion`] when the store was built by another
    /// version; the fix is [`reindex`](Index::reindex).
    pub fn open(kv: Arc<dyn KeyValue>, source: Arc<dyn BlobSource>) -> Result<Index> {
        match kv.get(keys::SCHEMA_VERSION_KEY) {
            Ok(v) => {
                let found = v.parse::<i64>().map_err(|_| {
                    Error::corrupt(format!("malformed schema version row {:?}", v))
                })?;
                if found != SCHEMA_VERSION {
                    return Err(Error::SchemaVersion { found, required: SCHEMA_VERSION });
                }
            }
            Err(Error::NotFound) => {
                if store_is_empty(kv.as_ref())? {
                    kv.set(keys::SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())?;
                } else {
                    return Err(Error::corrupt(
                        "index store has rows but no schema version row; \
                         you need to wipe and reindex it",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
        Ok(Index { kv, source })
    }

    /// Opens an index without the schema version gate, for callers
    /// about to [`reindex`](Index::reindex) anyway.
    pub fn open_for_reindex(kv: Arc<dyn KeyValue>, source: Arc<dyn BlobSource>) -> Index {
        Index { kv, source }
    }

    /// Indexes one blob: derives its rows and commits them as a
    /// single atomic batch.
    ///
    /// Re-indexing an already-indexed blob rewrites the same rows.
    pub fn index_blob(&self, br: &BlobRef, data: &[u8]) -> Result<()> {
        let mut bm = self.kv.begin_batch();
        derive_rows(&mut bm, br, data);
        self.kv.commit_batch(bm)
    }

    /// Wipes the row store and rebuilds every row from the source.
    ///
    /// Enumeration order is the source's sorted order, and each blob
    /// goes through [`index_blob`](Index::index_blob), so two rebuilds
    /// of the same source produce byte-identical stores. Blobs are
    /// fanned out to a small worker pool over a bounded queue.
    ///
    /// # Errors
    ///
    /// [`Error::WipeUnsupported`] if the store cannot be wiped, and
    /// [`Error::Reindex`] when any blob's rows could not be written;
    /// the store is still consistent for the blobs that succeeded.
    pub fn reindex(&self) -> Result<()> {
        log::info!("wiping index store before rebuild");
        self.kv.wipe()?;
        log::info!("index store wiped; rebuilding");
        self.kv.set(keys::SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())?;

        let blobs = self.source.enumerate()?;
        let total = blobs.len();
        let failed = AtomicUsize::new(0);
        let (tx, rx) = crossbeam::channel::bounded::<BlobRef>(REINDEX_QUEUE_CAP);

        std::thread::scope(|s| {
            for _ in 0..REINDEX_WORKERS {
                let rx = rx.clone();
                let failed = &failed;
                s.spawn(move || {
                    for br in rx {
                        if let Err(e) = self.fetch_and_index(&br) {
                            log::warn!("failed to reindex {}: {}", br, e);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
            drop(rx);

            let mut last_log: Option<Instant> = None;
            for (n, sb) in blobs.into_iter().enumerate() {
                if last_log.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
                    log::info!("reindexing at {} ({} / {} blobs)", sb.blobref, n, total);
                    last_log = Some(Instant::now());
                }
                if tx.send(sb.blobref).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        let failed = failed.load(Ordering::Relaxed);
        log::info!("index rebuild complete: {} blobs, {} failed", total, failed);
        if failed != 0 {
            return Err(Error::Reindex { failed });
        }
        Ok(())
    }

    fn fetch_and_index(&self, br: &BlobRef) -> Result<()> {
        let data = self.source.fetch(br)?;
        self.index_blob(br, &data)
    }

    /// Looks up the recorded size and MIME type of one blob.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the blob has not been indexed.
    pub fn get_blob_meta(&self, br: &BlobRef) -> Result<BlobMeta> {
        let v = self.kv.get(&keys::meta(br))?;
        let (size, mime) = keys::parse_meta_value(&v)?;
        Ok(BlobMeta { blobref: br.clone(), size, mime })
    }

    /// Lists every indexed blob, sorted by reference.
    pub fn enumerate_blob_meta(&self) -> Result<Vec<BlobMeta>> {
        let prefix = "meta:";
        let rows = collect_range(self.kv.as_ref(), prefix, &keys::prefix_end(prefix))?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let br = BlobRef::parse(&key[prefix.len()..])?;
            let (size, mime) = keys::parse_meta_value(&value)?;
            out.push(BlobMeta { blobref: br, size, mime });
        }
        Ok(out)
    }

    /// Finds the permanodes a signer has given an attribute value,
    /// newest claim first, each permanode listed once.
    pub fn permanodes_with_attr(
        &self,
        signer: &str,
        attr: &str,
        value: &str,
    ) -> Result<Vec<BlobRef>> {
        let prefix = keys::signer_attr_value_prefix(signer, attr, value);
        let rows = collect_range(self.kv.as_ref(), &prefix, &keys::prefix_end(&prefix))?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, permanode) in rows {
            let br = BlobRef::parse(&permanode)?;
            if seen.insert(br.clone()) {
                out.push(br);
            }
        }
        Ok(out)
    }

    /// Looks up the file metadata recorded for a file schema blob.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the blob is not an indexed file.
    pub fn get_file_info(&self, file_ref: &BlobRef) -> Result<FileInfo> {
        let v = self.kv.get(&keys::file_info(file_ref))?;
        let (size, file_name, mime_type) = keys::parse_file_info_value(&v)?;
        Ok(FileInfo { size, file_name, mime_type })
    }
}

fn store_is_empty(kv: &dyn KeyValue) -> Result<bool> {
    let mut it = kv.find("", "");
    let empty = !it.next();
    it.close()?;
    Ok(empty)
}

/// Appends the rows for one blob to `bm`.
///
/// Every blob gets `have:` and `meta:` rows. Schema blobs get rows for
/// their kind on top; a blob whose schema fields are unusable (for
/// example a claim without a permanode) still gets its base rows, so
/// re-runs stay deterministic.
fn derive_rows(bm: &mut BatchMutation, br: &BlobRef, data: &[u8]) {
    let size = data.len() as u64;
    let schema = SchemaBlob::parse(data);
    let mime = match &schema {
        Some(_) => "application/json",
        None if std::str::from_utf8(data).is_ok() => "text/plain",
        None => "application/octet-stream",
    };

    bm.set(keys::have(br), keys::have_value(size));
    bm.set(keys::meta(br), keys::meta_value(size, mime));

    match schema {
        Some(SchemaBlob::Claim { permanode, signer, claim_date, claim_type, attr, value }) => {
            if permanode.is_empty() || signer.is_empty() || claim_date.is_empty() {
                return;
            }
            bm.set(
                keys::claim(&permanode, &signer, &claim_date, br),
                keys::claim_value(&claim_type, &attr, &value),
            );
            let searchable = claim_type == "set-attribute" || claim_type == "add-attribute";
            if searchable && !attr.is_empty() {
                bm.set(
                    keys::signer_attr_value(&signer, &attr, &value, &claim_date, br),
                    permanode,
                );
            }
        }
        Some(SchemaBlob::File { file_name, size, mime_type }) => {
            bm.set(keys::file_info(br), keys::file_info_value(size, &file_name, &mime_type));
        }
        Some(SchemaBlob::Permanode { .. }) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemBlobSource;
    use crate::memkv::MemKeyValue;

    fn mem_pair() -> (Arc<dyn KeyValue>, Arc<MemBlobSource>) {
        (Arc::new(MemKeyValue::new()), Arc::new(MemBlobSource::new()))
    }

    fn claim_json(permanode: &BlobRef, date: &str, attr: &str, value: &str) -> String {
        format!(
            concat!(
                r#"{{"type": "claim", "permanode": "{}", "#,
                r#""signer": "sha256-{}", "claimDate": "{}", "#,
                r#""claimType": "set-attribute", "attr": "{}", "value": "{}"}}"#
            ),
            permanode,
            "b".repeat(64),
            date,
            attr,
            value,
        )
    }

    #[test]
    fn test_open_stamps_version_on_empty_store() {
        let (kv, source) = mem_pair();
        let _idx = Index::open(kv.clone(), source).unwrap();
        let stored = kv.get(keys::SCHEMA_VERSION_KEY).unwrap();
        assert_eq!(stored, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_open_rejects_versionless_rows() {
        let (kv, source) = mem_pair();
        kv.set("meta:sha256-0000", "1|text/plain").unwrap();
        let err = Index::open(kv, source).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)), "got {:?}", err);
    }

    #[test]
    fn test_open_rejects_version_mismatch() {
        let (kv, source) = mem_pair();
        kv.set(keys::SCHEMA_VERSION_KEY, "3").unwrap();
        let err = Index::open(kv, source).unwrap_err();
        assert!(
            matches!(err, Error::SchemaVersion { found: 3, required: SCHEMA_VERSION }),
            "got {:?}",
            err
        );
    }

    #[test]
    fn test_index_blob_writes_claim_rows() {
        let (kv, source) = mem_pair();
        let pn = BlobRef::from_bytes(b"some permanode blob");
        let idx = Index::open(kv.clone(), source).unwrap();

        let data = claim_json(&pn, "2014-06-01T12:30:05Z", "tag", "beach");
        let br = BlobRef::from_bytes(data.as_bytes());
        idx.index_blob(&br, data.as_bytes()).unwrap();

        assert_eq!(kv.get(&keys::have(&br)).unwrap(), data.len().to_string());
        let meta = idx.get_blob_meta(&br).unwrap();
        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(meta.mime, "application/json");

        let pns = idx.permanodes_with_attr(&format!("sha256-{}", "b".repeat(64)), "tag", "beach").unwrap();
        assert_eq!(pns, vec![pn]);
    }

    #[test]
    fn test_index_blob_skips_unusable_claim_fields() {
        let (kv, source) = mem_pair();
        let idx = Index::open(kv.clone(), source).unwrap();

        let data = r#"{"type": "claim", "permanode": "", "signer": "s", "claimDate": "d", "claimType": "set-attribute", "attr": "a", "value": "v"}"#;
        let br = BlobRef::from_bytes(data.as_bytes());
        idx.index_blob(&br, data.as_bytes()).unwrap();

        // Base rows only.
        assert!(kv.get(&keys::meta(&br)).is_ok());
        let claims = collect_range(kv.as_ref(), "claim|", &keys::prefix_end("claim|")).unwrap();
        assert!(claims.is_empty());
    }

    #[test]
    fn test_reindex_rebuilds_all_rows() {
        let (kv, source) = mem_pair();
        let pn_data = r#"{"type": "permanode", "random": "nonce-1"}"#;
        let pn = source.put(pn_data.as_bytes().to_vec());
        let claim = claim_json(&pn, "2015-03-02T08:00:00Z", "title", "holiday");
        source.put(claim.into_bytes());
        let file = r#"{"type": "file", "fileName": "cat.jpg", "size": 9999, "mimeType": "image/jpeg"}"#;
        let file_ref = source.put(file.as_bytes().to_vec());
        source.put(Vec::from(&b"just some raw bytes"[..]));

        let idx = Index::open_for_reindex(kv.clone(), source.clone());
        idx.reindex().unwrap();

        let metas = idx.enumerate_blob_meta().unwrap();
        assert_eq!(metas.len(), 4);
        let refs: Vec<&BlobRef> = metas.iter().map(|m| &m.blobref).collect();
        let mut sorted = refs.clone();
        sorted.sort();
        assert_eq!(refs, sorted);

        let info = idx.get_file_info(&file_ref).unwrap();
        assert_eq!(info.size, 9999);
        assert_eq!(info.file_name, "cat.jpg");
        assert_eq!(info.mime_type, "image/jpeg");

        let pns = idx
            .permanodes_with_attr(&format!("sha256-{}", "b".repeat(64)), "title", "holiday")
            .unwrap();
        assert_eq!(pns, vec![pn]);
    }

    #[test]
    fn test_reindex_is_deterministic() {
        let source = Arc::new(MemBlobSource::new());
        for i in 0..30 {
            let pn = source.put(format!(r#"{{"type": "permanode", "random": "{}"}}"#, i).into_bytes());
            let claim = claim_json(&pn, "2016-01-02T03:04:05Z", "tag", &format!("t{}", i % 3));
            source.put(claim.into_bytes());
        }

        let dump = |kv: &Arc<dyn KeyValue>| collect_range(kv.as_ref(), "", "").unwrap();

        let kv_a: Arc<dyn KeyValue> = Arc::new(MemKeyValue::new());
        Index::open_for_reindex(kv_a.clone(), source.clone()).reindex().unwrap();
        let kv_b: Arc<dyn KeyValue> = Arc::new(MemKeyValue::new());
        Index::open_for_reindex(kv_b.clone(), source.clone()).reindex().unwrap();

        let a = dump(&kv_a);
        assert!(!a.is_empty());
        assert_eq!(a, dump(&kv_b));
    }

    #[test]
    fn test_reindex_counts_unfetchable_blobs() {
        struct HoleySource {
            inner: MemBlobSource,
            missing: BlobRef,
        }
        impl BlobSource for HoleySource {
            fn enumerate(&self) -> Result<Vec<crate::blob::SizedBlobRef>> {
                let mut all = self.inner.enumerate()?;
                all.push(crate::blob::SizedBlobRef { blobref: self.missing.clone(), size: 1 });
                all.sort_by(|a, b| a.blobref.cmp(&b.blobref));
                Ok(all)
            }
            fn fetch(&self, br: &BlobRef) -> Result<bytes::Bytes> {
                self.inner.fetch(br)
            }
        }

        let inner = MemBlobSource::new();
        inner.put(Vec::from(&b"present blob"[..]));
        let source = Arc::new(HoleySource {
            inner,
            missing: BlobRef::from_bytes(b"enumerated but never stored"),
        });
        let kv: Arc<dyn KeyValue> = Arc::new(MemKeyValue::new());

        let err = Index::open_for_reindex(kv.clone(), source).reindex().unwrap_err();
        assert!(matches!(err, Error::Reindex { failed: 1 }), "got {:?}", err);
        // The present blob's rows still landed.
        assert_eq!(Index::open(kv, Arc::new(MemBlobSource::new())).unwrap()
            .enumerate_blob_meta().unwrap().len(), 1);
    }

    #[test]
    fn test_reindex_requires_wipe_support() {
        struct NoWipe(MemKeyValue);
        impl KeyValue for NoWipe {
            fn get(&self, key: &str) -> Result<String> {
                self.0.get(key)
            }
            fn set(&self, key: &str, value: &str) -> Result<()> {
                self.0.set(key, value)
            }
            fn delete(&self, key: &str) -> Result<()> {
                self.0.delete(key)
            }
            fn find(&self, start: &str, end: &str) -> Box<dyn Iter> {
                self.0.find(start, end)
            }
            fn commit_batch(&self, batch: BatchMutation) -> Result<()> {
                self.0.commit_batch(batch)
            }
            fn close(&self) -> Result<()> {
                self.0.close()
            }
        }

        let kv: Arc<dyn KeyValue> = Arc::new(NoWipe(MemKeyValue::new()));
        let idx = Index::open_for_reindex(kv, Arc::new(MemBlobSource::new()));
        assert!(matches!(idx.reindex().unwrap_err(), Error::WipeUnsupported));
    }
}
