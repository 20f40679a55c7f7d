// Sorted Key-Value Contract Tests
// Runs the same behavioral checks against every registered backend, so
// the backends stay interchangeable.

use std::path::Path;

use proptest::prelude::*;
use sortedkv::{collect_range, Config, Error, Iter, KeyValue, ReadSnapshot, Registry};
use sortedkv::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use tempfile::TempDir;

const ALL_BACKENDS: &[&str] = &["mem", "sled", "sqlite", "kvfile"];
const DISK_BACKENDS: &[&str] = &["sled", "sqlite", "kvfile"];

fn config_for(backend: &str, dir: &Path) -> Config {
    let json = if backend == "mem" {
        r#"{"type": "mem"}"#.to_owned()
    } else {
        format!(
            r#"{{"type": "{}", "file": "{}"}}"#,
            backend,
            dir.join(format!("{}-store", backend)).display()
        )
    };
    Config::parse(&json).unwrap()
}

fn open_store(backend: &str, dir: &Path) -> Box<dyn KeyValue> {
    let registry = Registry::with_default_backends();
    registry.open(&config_for(backend, dir)).unwrap()
}

fn is_empty(kv: &dyn KeyValue) -> bool {
    let mut it = kv.find("", "");
    let has_row = it.next();
    it.close().unwrap();
    !has_row
}

/// Asserts that `find(start, end)` yields exactly `want` values, in
/// order. Keys in these tests always map to `<key>v`, so the values
/// also pin which keys were seen.
fn check_enumerate(backend: &str, kv: &dyn KeyValue, start: &str, end: &str, want: &[&str]) {
    let mut got = Vec::new();
    let mut it = kv.find(start, end);
    while it.next() {
        assert_eq!(
            format!("{}v", it.key()),
            it.value(),
            "[{}] iterator returned unexpected pair: {:?}, {:?}",
            backend,
            it.key(),
            it.value()
        );
        got.push(it.value().to_owned());
    }
    it.close().unwrap_or_else(|e| panic!("[{}] close after find({:?}, {:?}): {}", backend, start, end, e));
    let want: Vec<String> = want.iter().map(|s| s.to_string()).collect();
    assert_eq!(got, want, "[{}] enumerate of ({:?}, {:?})", backend, start, end);
}

/// Test basic get/set/delete including the not-found sentinel and
/// idempotent deletes
#[test]
fn test_set_get_delete() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        assert!(is_empty(kv.as_ref()), "[{}] new store not empty", backend);

        kv.set("foo", "bar").unwrap();
        assert!(!is_empty(kv.as_ref()), "[{}] store empty after set", backend);
        assert_eq!(kv.get("foo").unwrap(), "bar", "[{}]", backend);

        let err = kv.get("NOT_EXIST").unwrap_err();
        assert!(err.is_not_found(), "[{}] got {:?}", backend, err);

        // Deleting twice is not an error.
        for _ in 0..2 {
            kv.delete("foo").unwrap();
        }
        assert!(kv.get("foo").unwrap_err().is_not_found(), "[{}]", backend);
        kv.close().unwrap();
    }
}

/// Test the half-open [start, end) range semantics of find
#[test]
fn test_find_ranges() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        kv.set("a", "av").unwrap();
        kv.set("b", "bv").unwrap();
        kv.set("c", "cv").unwrap();

        check_enumerate(backend, kv.as_ref(), "", "", &["av", "bv", "cv"]);
        check_enumerate(backend, kv.as_ref(), "a", "", &["av", "bv", "cv"]);
        check_enumerate(backend, kv.as_ref(), "b", "", &["bv", "cv"]);
        check_enumerate(backend, kv.as_ref(), "a", "c", &["av", "bv"]);
        check_enumerate(backend, kv.as_ref(), "a", "b", &["av"]);
        check_enumerate(backend, kv.as_ref(), "a", "a", &[]);
        check_enumerate(backend, kv.as_ref(), "d", "", &[]);
        check_enumerate(backend, kv.as_ref(), "d", "e", &[]);
        // A reversed range is empty, not an error or a panic.
        check_enumerate(backend, kv.as_ref(), "b", "a", &[]);
        check_enumerate(backend, kv.as_ref(), "c", "a", &[]);
        kv.close().unwrap();
    }
}

/// Test that key comparison is byte-wise everywhere, not subject to any
/// engine collation
#[test]
fn test_find_byte_collation() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());

        // '|' (0x7c) sorts below '}' (0x7d).
        kv.set("foo|abc", "foo|abcv").unwrap();
        check_enumerate(backend, kv.as_ref(), "foo|", "", &["foo|abcv"]);
        check_enumerate(backend, kv.as_ref(), "foo|", "foo}", &["foo|abcv"]);

        // Multi-byte UTF-8 sorts by its bytes: "é" (0xc3 0xa9) > "z".
        kv.set("z", "zv").unwrap();
        kv.set("é", "év").unwrap();
        check_enumerate(backend, kv.as_ref(), "z", "", &["zv", "év"]);
        kv.close().unwrap();
    }
}

/// Test that range bounds compare against keys, never against values
#[test]
fn test_find_ignores_values() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        kv.set("y", "x:foo").unwrap();
        check_enumerate(backend, kv.as_ref(), "x:", "x~", &[]);
        kv.close().unwrap();
    }
}

/// Test that maximum-size keys and values are stored without truncation
#[test]
fn test_max_sizes_accepted() {
    // Trailing 'B' markers catch silent truncation.
    let large_key = format!("{}B", "A".repeat(MAX_KEY_SIZE - 1));
    let large_value = format!("{}B", "A".repeat(MAX_VALUE_SIZE - 1));

    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());

        kv.set(&large_key, "whatever").unwrap();
        let mut it = kv.find(&large_key, "");
        assert!(it.next(), "[{}] large key not found", backend);
        assert_eq!(it.key(), large_key, "[{}] large key truncated", backend);
        assert_eq!(it.value(), "whatever", "[{}]", backend);
        it.close().unwrap();

        kv.set("whatever", &large_value).unwrap();
        assert_eq!(kv.get("whatever").unwrap(), large_value, "[{}] large value truncated", backend);

        kv.set(&large_key, &large_value).unwrap();
        assert_eq!(kv.get(&large_key).unwrap(), large_value, "[{}]", backend);
        kv.close().unwrap();
    }
}

/// Test that oversize keys and values are hard errors and leave no
/// partial write behind
#[test]
fn test_oversize_rejected() {
    let over_key = "k".repeat(MAX_KEY_SIZE + 1);
    let over_value = "v".repeat(MAX_VALUE_SIZE + 1);

    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());

        let err = kv.set(&over_key, "whatever").unwrap_err();
        assert!(matches!(err, Error::KeyTooLarge(_)), "[{}] got {:?}", backend, err);

        let err = kv.set("whatever", &over_value).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge(_)), "[{}] got {:?}", backend, err);

        assert!(is_empty(kv.as_ref()), "[{}] rejected write left data", backend);
        kv.close().unwrap();
    }
}

/// Test that a committed batch applies all mutations in order
#[test]
fn test_batch_commit() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        kv.set("doomed", "soon gone").unwrap();

        let mut batch = kv.begin_batch();
        batch.set("one", "1");
        batch.set("two", "2");
        batch.delete("doomed");
        batch.delete("never-existed");
        batch.set("one", "1-again");
        kv.commit_batch(batch).unwrap();

        assert_eq!(kv.get("one").unwrap(), "1-again", "[{}] later mutation must win", backend);
        assert_eq!(kv.get("two").unwrap(), "2", "[{}]", backend);
        assert!(kv.get("doomed").unwrap_err().is_not_found(), "[{}]", backend);
        kv.close().unwrap();
    }
}

/// Test that an invalid batch commits nothing at all
#[test]
fn test_batch_oversize_rejected_atomically() {
    let over_value = "v".repeat(MAX_VALUE_SIZE + 1);

    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());

        let mut batch = kv.begin_batch();
        batch.set("good", "fine");
        batch.set("bad", over_value.as_str());
        let err = kv.commit_batch(batch).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge(_)), "[{}] got {:?}", backend, err);

        assert!(
            kv.get("good").unwrap_err().is_not_found(),
            "[{}] rejected batch partially applied",
            backend
        );
        kv.close().unwrap();
    }
}

/// Test wipe: everything goes, and the store keeps working
#[test]
fn test_wipe() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        for i in 0..20 {
            kv.set(&format!("key{:02}", i), "x").unwrap();
        }

        kv.wipe().unwrap();
        assert!(is_empty(kv.as_ref()), "[{}] store not empty after wipe", backend);

        kv.set("reborn", "yes").unwrap();
        assert_eq!(kv.get("reborn").unwrap(), "yes", "[{}]", backend);
        kv.close().unwrap();
    }
}

/// Test that disk backends persist across close and reopen
#[test]
fn test_close_reopen_persists() {
    for backend in DISK_BACKENDS {
        let dir = TempDir::new().unwrap();
        {
            let kv = open_store(backend, dir.path());
            for i in 0..50 {
                kv.set(&format!("persist{:02}", i), &format!("value{}", i)).unwrap();
            }
            kv.close().unwrap();
        }
        {
            let kv = open_store(backend, dir.path());
            for i in 0..50 {
                assert_eq!(
                    kv.get(&format!("persist{:02}", i)).unwrap(),
                    format!("value{}", i),
                    "[{}] row lost across reopen",
                    backend
                );
            }
            kv.close().unwrap();
        }
    }
}

/// Test snapshot isolation where offered, and the unsupported error
/// where not
#[test]
fn test_snapshots() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        kv.set("a", "before").unwrap();

        match kv.snapshot() {
            Ok(snap) => {
                kv.set("a", "after").unwrap();
                kv.set("b", "new").unwrap();

                assert_eq!(snap.get("a").unwrap(), "before", "[{}] snapshot saw later write", backend);
                assert!(snap.get("b").unwrap_err().is_not_found(), "[{}]", backend);

                let mut it = snap.find("", "");
                assert!(it.next());
                assert_eq!((it.key(), it.value()), ("a", "before"), "[{}]", backend);
                assert!(!it.next(), "[{}] snapshot iterator saw later write", backend);
                it.close().unwrap();

                // The live store sees everything.
                assert_eq!(kv.get("a").unwrap(), "after", "[{}]", backend);
            }
            Err(Error::SnapshotUnsupported) => {
                assert!(
                    matches!(*backend, "sled" | "sqlite"),
                    "[{}] unexpectedly lacks snapshots",
                    backend
                );
            }
            Err(e) => panic!("[{}] snapshot failed: {}", backend, e),
        }
        kv.close().unwrap();
    }
}

/// Test that iterators stay usable while the store keeps changing
#[test]
fn test_find_during_writes() {
    for backend in ALL_BACKENDS {
        let dir = TempDir::new().unwrap();
        let kv = open_store(backend, dir.path());
        for i in 0..100 {
            kv.set(&format!("stable{:03}", i), "x").unwrap();
        }

        let mut seen = 0;
        let mut it = kv.find("stable", "");
        while it.next() {
            seen += 1;
            // Interleave writes outside the scanned range.
            kv.set(&format!("noise{:03}", seen), "y").unwrap();
        }
        it.close().unwrap();
        assert_eq!(seen, 100, "[{}]", backend);
        kv.close().unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any set of insertions comes back from a full scan sorted by key
    /// bytes, with exactly one entry per distinct key.
    #[test]
    fn prop_full_scan_is_sorted_and_deduplicated(
        entries in proptest::collection::btree_map("[a-z|]{1,8}", "[a-z]{0,6}", 0..40)
    ) {
        let registry = Registry::with_default_backends();
        let kv = registry.open(&Config::parse(r#"{"type": "mem"}"#).unwrap()).unwrap();
        for (k, v) in &entries {
            kv.set(k, v).unwrap();
        }
        let got = collect_range(kv.as_ref(), "", "").unwrap();
        let want: Vec<(String, String)> = entries.into_iter().collect();
        prop_assert_eq!(got, want);
    }
}
