//! Row key and value encoding for the index.
//!
//! Every row is a `|`-separated string whose first segment names the
//! row type. Free-text segments (attribute names, values, file names)
//! are query-escaped so they cannot contain the separator; blob refs
//! and RFC 3339 dates are already separator-free and stay raw. Claim
//! dates in search keys are stored nine's-complemented so that a
//! forward scan visits newest claims first.

use crate::blob::BlobRef;
use crate::error::{Error, Result};

/// Key of the row recording the schema version the rows were built
/// with. Incremented when any row type changes shape, which forces a
/// wipe and reindex on open.
pub const SCHEMA_VERSION_KEY: &str = "schemaversion";

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Query-escapes free text for embedding in a row.
///
/// Unreserved characters (`A-Z a-z 0-9 - _ . ~`) pass through, space
/// becomes `+`, and every other byte becomes `%XX`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX_UPPER[(b >> 4) as usize] as char);
                out.push(HEX_UPPER[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

/// Reverses [`escape`]. Malformed escapes pass through literally
/// rather than erroring; rows are written by this module, so they only
/// appear if the store was edited by hand.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Nine's-complements the digits of an RFC 3339 date and prepends
/// `rt`, producing a string whose lexicographic order is the reverse
/// of chronological order.
pub fn reverse_time(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push_str("rt");
    for c in s.chars() {
        out.push(match c {
            '0'..='9' => (b'9' - (c as u8) + b'0') as char,
            _ => c,
        });
    }
    out
}

/// Recovers the original date from a [`reverse_time`] string.
pub fn unreverse_time(s: &str) -> String {
    let s = s.strip_prefix("rt").unwrap_or(s);
    s.chars()
        .map(|c| match c {
            '0'..='9' => (b'9' - (c as u8) + b'0') as char,
            _ => c,
        })
        .collect()
}

/// `meta:<blobref>` — one row per known blob; the backbone row the
/// enumeration walks.
pub fn meta(br: &BlobRef) -> String {
    format!("meta:{}", br)
}

/// Value of a `meta:` row: `<size>|<mimetype>`.
pub fn meta_value(size: u64, mime: &str) -> String {
    format!("{}|{}", size, mime)
}

/// Splits a `meta:` row value back into size and MIME type.
pub fn parse_meta_value(v: &str) -> Result<(u64, String)> {
    let (size, mime) = v
        .split_once('|')
        .ok_or_else(|| Error::corrupt(format!("malformed meta row value {:?}", v)))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| Error::corrupt(format!("malformed size in meta row value {:?}", v)))?;
    Ok((size, mime.to_owned()))
}

/// `have:<blobref>` — receipt marker written alongside the meta row.
pub fn have(br: &BlobRef) -> String {
    format!("have:{}", br)
}

/// Value of a `have:` row: the blob size.
pub fn have_value(size: u64) -> String {
    size.to_string()
}

/// `claim|<permanode>|<signer>|<claimdate>|<claimref>` — one row per
/// attribute claim, keyed so a permanode's claims scan in date order.
pub fn claim(permanode: &str, signer: &str, claim_date: &str, claim_ref: &BlobRef) -> String {
    format!("claim|{}|{}|{}|{}", permanode, signer, claim_date, claim_ref)
}

/// Value of a `claim|` row: `<claimtype>|<attr>|<value>`, each
/// escaped.
pub fn claim_value(claim_type: &str, attr: &str, value: &str) -> String {
    format!("{}|{}|{}", escape(claim_type), escape(attr), escape(value))
}

/// Splits a `claim|` row value into (claim type, attr, value).
pub fn parse_claim_value(v: &str) -> Result<(String, String, String)> {
    let mut parts = v.split('|');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(ct), Some(attr), Some(value), None) => {
            Ok((unescape(ct), unescape(attr), unescape(value)))
        }
        _ => Err(Error::corrupt(format!("malformed claim row value {:?}", v))),
    }
}

/// `signerattrvalue|<signer>|<attr>|<value>|<reversed-date>|<claimref>`
/// — the attribute-search row; its value is the permanode ref.
pub fn signer_attr_value(
    signer: &str,
    attr: &str,
    value: &str,
    claim_date: &str,
    claim_ref: &BlobRef,
) -> String {
    format!(
        "signerattrvalue|{}|{}|{}|{}|{}",
        signer,
        escape(attr),
        escape(value),
        reverse_time(claim_date),
        claim_ref,
    )
}

/// Scan prefix covering every `signerattrvalue` row for one
/// (signer, attr, value) triple.
pub fn signer_attr_value_prefix(signer: &str, attr: &str, value: &str) -> String {
    format!("signerattrvalue|{}|{}|{}|", signer, escape(attr), escape(value))
}

/// `fileinfo|<fileref>` — metadata row for file schema blobs.
pub fn file_info(br: &BlobRef) -> String {
    format!("fileinfo|{}", br)
}

/// Value of a `fileinfo|` row: `<size>|<filename>|<mimetype>`, the
/// text parts escaped.
pub fn file_info_value(size: u64, file_name: &str, mime: &str) -> String {
    format!("{}|{}|{}", size, escape(file_name), escape(mime))
}

/// Splits a `fileinfo|` row value into (size, file name, MIME type).
pub fn parse_file_info_value(v: &str) -> Result<(u64, String, String)> {
    let mut parts = v.split('|');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(size), Some(name), Some(mime), None) => {
            let size = size.parse::<u64>().map_err(|_| {
                Error::corrupt(format!("malformed size in fileinfo row value {:?}", v))
            })?;
            Ok((size, unescape(name), unescape(mime)))
        }
        _ => Err(Error::corrupt(format!("malformed fileinfo row value {:?}", v))),
    }
}

/// Computes the exclusive end key for a prefix scan: the prefix with
/// its final byte incremented.
///
/// # Panics
///
/// Panics on an empty prefix or one ending in `0xff`; row prefixes are
/// fixed ASCII strings, so neither occurs.
pub fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    let last = bytes.last_mut().expect("empty scan prefix");
    assert!(*last < 0xff, "scan prefix not incrementable");
    *last += 1;
    // Incrementing the last byte of ASCII stays ASCII.
    String::from_utf8(bytes).expect("incremented prefix no longer UTF-8")
}
