//! Base-36 integers and the keyed hash container format.
//!
//! The hash container is the line-oriented `K`/`V` format shared by
//! directory listings, property lists and changed-path blocks:
//!
//! ```text
//! K 4
//! name
//! V 5
//! value
//! END
//! ```
//!
//! Incremental logs append further `K`/`V` pairs or `D <len>\n<key>\n`
//! deletion records *after* the `END` terminator of the base snapshot.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use fsvn_error::{FsError, Result};

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a number in lowercase base-36.
#[must_use]
pub fn base36_encode(mut value: u64) -> String {
    let mut buf = [0u8; 13];
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = BASE36_DIGITS[(value % 36) as usize];
        value /= 36;
        if value == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf[pos..]).into_owned()
}

/// Decode a lowercase base-36 number. Returns `None` on empty input, an
/// invalid digit, or overflow.
#[must_use]
pub fn base36_decode(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for c in text.bytes() {
        let digit = match c {
            b'0'..=b'9' => u64::from(c - b'0'),
            b'a'..=b'z' => u64::from(c - b'a') + 10,
            _ => return None,
        };
        value = value.checked_mul(36)?.checked_add(digit)?;
    }
    Some(value)
}

/// One record of an incremental hash log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashEntry {
    Set(String, Vec<u8>),
    Delete(String),
}

/// Write a full hash in canonical (lexicographic) order, with the `END`
/// terminator.
pub fn write_hash<W: Write>(out: &mut W, hash: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    for (key, value) in hash {
        write_hash_set(out, key, value)?;
    }
    out.write_all(b"END\n")?;
    Ok(())
}

/// Append one `K`/`V` pair (no terminator).
pub fn write_hash_set<W: Write>(out: &mut W, key: &str, value: &[u8]) -> Result<()> {
    write!(out, "K {}\n{key}\nV {}\n", key.len(), value.len())?;
    out.write_all(value)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Append one `D` deletion record (no terminator).
pub fn write_hash_delete<W: Write>(out: &mut W, key: &str) -> Result<()> {
    write!(out, "D {}\n{key}\n", key.len())?;
    Ok(())
}

fn read_counted<R: BufRead>(input: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len + 1];
    std::io::Read::read_exact(input, &mut buf)
        .map_err(|_| FsError::corrupt(format!("truncated hash {what}")))?;
    if buf.pop() != Some(b'\n') {
        return Err(FsError::corrupt(format!("unterminated hash {what}")));
    }
    Ok(buf)
}

fn parse_len(line: &str, prefix: &str) -> Result<usize> {
    line.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| FsError::corrupt(format!("malformed hash header line '{line}'")))
}

/// Read hash entries until the `END` terminator or end of input.
///
/// Returns the entries in stream order and whether the terminator was seen.
/// Callers replaying incremental logs call this once for the base snapshot
/// (terminated) and fold the remaining entries themselves.
pub fn read_hash_entries<R: BufRead>(input: &mut R) -> Result<(Vec<HashEntry>, bool)> {
    let mut entries = Vec::new();
    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok((entries, false));
        }
        let line = line.trim_end_matches('\n');
        if line == "END" {
            return Ok((entries, true));
        }
        if line.starts_with("K ") {
            let key = read_counted(input, parse_len(line, "K ")?, "key")?;
            let key = String::from_utf8(key)
                .map_err(|_| FsError::corrupt("hash key is not valid UTF-8"))?;
            let mut vline = String::new();
            input.read_line(&mut vline)?;
            let vline = vline.trim_end_matches('\n');
            let value = read_counted(input, parse_len(vline, "V ")?, "value")?;
            entries.push(HashEntry::Set(key, value));
        } else if line.starts_with("D ") {
            let key = read_counted(input, parse_len(line, "D ")?, "key")?;
            let key = String::from_utf8(key)
                .map_err(|_| FsError::corrupt("hash key is not valid UTF-8"))?;
            entries.push(HashEntry::Delete(key));
        } else if line.is_empty() {
            // Tolerate a trailing blank line at end of input.
            continue;
        } else {
            return Err(FsError::corrupt(format!(
                "unexpected hash record line '{line}'"
            )));
        }
    }
}

/// Read a full terminated hash into a map, applying deletions in order.
pub fn read_hash<R: BufRead>(input: &mut R) -> Result<BTreeMap<String, Vec<u8>>> {
    let (entries, _) = read_hash_entries(input)?;
    let mut map = BTreeMap::new();
    for entry in entries {
        match entry {
            HashEntry::Set(key, value) => {
                map.insert(key, value);
            }
            HashEntry::Delete(key) => {
                map.remove(&key);
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn base36_known_values() {
        assert_eq!(base36_encode(0), "0");
        assert_eq!(base36_encode(35), "z");
        assert_eq!(base36_encode(36), "10");
        assert_eq!(base36_decode("zz"), Some(35 * 36 + 35));
        assert_eq!(base36_decode(""), None);
        assert_eq!(base36_decode("Z"), None);
    }

    proptest! {
        #[test]
        fn base36_round_trip(value in any::<u64>()) {
            prop_assert_eq!(base36_decode(&base36_encode(value)), Some(value));
        }
    }

    #[test]
    fn hash_round_trip() {
        let mut hash = BTreeMap::new();
        hash.insert("iota".to_owned(), b"file t1-3".to_vec());
        hash.insert("A".to_owned(), b"dir t1-4".to_vec());
        let mut buf = Vec::new();
        write_hash(&mut buf, &hash).unwrap();
        let read = read_hash(&mut &buf[..]).unwrap();
        assert_eq!(read, hash);
    }

    #[test]
    fn hash_canonical_order_is_lexicographic() {
        let mut hash = BTreeMap::new();
        hash.insert("b".to_owned(), b"2".to_vec());
        hash.insert("a".to_owned(), b"1".to_vec());
        let mut buf = Vec::new();
        write_hash(&mut buf, &hash).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.find("a\n").unwrap() < text.find("b\n").unwrap());
        assert!(text.ends_with("END\n"));
    }

    #[test]
    fn incremental_entries_after_terminator() {
        let mut buf = Vec::new();
        write_hash(&mut buf, &BTreeMap::new()).unwrap();
        write_hash_set(&mut buf, "x", b"1").unwrap();
        write_hash_delete(&mut buf, "x").unwrap();

        let mut cursor = &buf[..];
        let (base, terminated) = read_hash_entries(&mut cursor).unwrap();
        assert!(terminated);
        assert!(base.is_empty());
        let (tail, terminated) = read_hash_entries(&mut cursor).unwrap();
        assert!(!terminated);
        assert_eq!(
            tail,
            vec![
                HashEntry::Set("x".to_owned(), b"1".to_vec()),
                HashEntry::Delete("x".to_owned()),
            ]
        );
    }

    #[test]
    fn values_may_contain_newlines() {
        let mut buf = Vec::new();
        write_hash_set(&mut buf, "k", b"line1\nline2").unwrap();
        buf.extend_from_slice(b"END\n");
        let read = read_hash(&mut &buf[..]).unwrap();
        assert_eq!(read["k"], b"line1\nline2");
    }

    #[test]
    fn truncated_value_is_corrupt() {
        let buf = b"K 1\nk\nV 10\nshort\n";
        assert!(matches!(
            read_hash(&mut &buf[..]),
            Err(FsError::Corrupt { .. })
        ));
    }
}
