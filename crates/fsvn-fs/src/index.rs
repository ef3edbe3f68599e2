//! Log-to-phys and phys-to-log indexes.
//!
//! While a transaction is open, every item appended to the proto-rev file
//! also appends one fixed-size record to each of two append-only proto-index
//! streams in the transaction directory. At commit the proto streams are
//! folded into the final per-revision index files:
//!
//! - `<rev>.l2p` maps item index → file offset (sorted by item index),
//! - `<rev>.p2l` maps file offset → (size, item type, item index) (sorted
//!   by offset).
//!
//! All integers are little-endian. The final files carry a magic and an
//! entry count; the formats are private to this implementation.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use fsvn_error::{FsError, Result};
use fsvn_types::{RevisionNumber, TxnId};

use crate::fs::FileSystem;
use crate::io;

const L2P_MAGIC: &[u8; 4] = b"L2P1";
const P2L_MAGIC: &[u8; 4] = b"P2L1";

/// What kind of item an index entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    NodeRev = 1,
    FileRep = 2,
    DirRep = 3,
    FileProps = 4,
    DirProps = 5,
    Changes = 6,
}

impl ItemType {
    fn from_raw(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => Self::NodeRev,
            2 => Self::FileRep,
            3 => Self::DirRep,
            4 => Self::FileProps,
            5 => Self::DirProps,
            6 => Self::Changes,
            other => return Err(FsError::corrupt(format!("unknown item type {other}"))),
        })
    }
}

/// One phys-to-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2lEntry {
    pub offset: u64,
    pub size: u64,
    pub item_type: ItemType,
    pub item: u64,
}

/// One log-to-phys entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2pEntry {
    pub item: u64,
    pub offset: u64,
}

// --- proto streams ---

/// Append `(item, offset)` to the transaction's log-to-phys proto index.
pub fn store_l2p_proto_entry(fs: &FileSystem, txn_id: TxnId, offset: u64, item: u64) -> Result<()> {
    let mut file = io::open_append(&fs.layout().txn_l2p_proto_index(txn_id))?;
    file.write_all(&item.to_le_bytes())?;
    file.write_all(&offset.to_le_bytes())?;
    Ok(())
}

/// Append an entry to the transaction's phys-to-log proto index.
pub fn store_p2l_proto_entry(fs: &FileSystem, txn_id: TxnId, entry: &P2lEntry) -> Result<()> {
    let mut file = io::open_append(&fs.layout().txn_p2l_proto_index(txn_id))?;
    file.write_all(&entry.offset.to_le_bytes())?;
    file.write_all(&entry.size.to_le_bytes())?;
    file.write_all(&[entry.item_type as u8])?;
    file.write_all(&entry.item.to_le_bytes())?;
    Ok(())
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FsError::corrupt("truncated proto-index record"));
        }
        filled += n;
    }
    Ok(true)
}

/// Read a log-to-phys proto index stream.
pub fn read_l2p_proto(path: &Path) -> Result<Vec<L2pEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    let mut record = [0u8; 16];
    while read_exact_or_eof(&mut file, &mut record)? {
        entries.push(L2pEntry {
            item: u64::from_le_bytes(record[0..8].try_into().expect("record slice")),
            offset: u64::from_le_bytes(record[8..16].try_into().expect("record slice")),
        });
    }
    Ok(entries)
}

/// Read a phys-to-log proto index stream.
pub fn read_p2l_proto(path: &Path) -> Result<Vec<P2lEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut entries = Vec::new();
    let mut record = [0u8; 25];
    while read_exact_or_eof(&mut file, &mut record)? {
        entries.push(P2lEntry {
            offset: u64::from_le_bytes(record[0..8].try_into().expect("record slice")),
            size: u64::from_le_bytes(record[8..16].try_into().expect("record slice")),
            item_type: ItemType::from_raw(record[16])?,
            item: u64::from_le_bytes(record[17..25].try_into().expect("record slice")),
        });
    }
    Ok(entries)
}

// --- final files ---

/// Build the final log-to-phys file at `target` from proto entries.
pub fn write_final_l2p(target: &Path, mut entries: Vec<L2pEntry>) -> Result<()> {
    entries.sort_unstable_by_key(|e| e.item);
    let mut buf = Vec::with_capacity(12 + entries.len() * 16);
    buf.extend_from_slice(L2P_MAGIC);
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in &entries {
        buf.extend_from_slice(&entry.item.to_le_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
    }
    io::write_atomic(target, &buf)
}

/// Build the final phys-to-log file at `target` from proto entries.
pub fn write_final_p2l(target: &Path, mut entries: Vec<P2lEntry>) -> Result<()> {
    entries.sort_unstable_by_key(|e| e.offset);
    let mut buf = Vec::with_capacity(12 + entries.len() * 25);
    buf.extend_from_slice(P2L_MAGIC);
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in &entries {
        buf.extend_from_slice(&entry.offset.to_le_bytes());
        buf.extend_from_slice(&entry.size.to_le_bytes());
        buf.push(entry.item_type as u8);
        buf.extend_from_slice(&entry.item.to_le_bytes());
    }
    io::write_atomic(target, &buf)
}

fn read_header<'a>(data: &'a [u8], magic: &[u8; 4], path: &Path) -> Result<(&'a [u8], usize)> {
    let corrupt = |what: &str| {
        FsError::corrupt(format!("index file '{}': {what}", path.display()))
    };
    if data.len() < 12 || &data[0..4] != magic {
        return Err(corrupt("bad header"));
    }
    let count = u64::from_le_bytes(data[4..12].try_into().expect("header slice"));
    let count = usize::try_from(count).map_err(|_| corrupt("entry count out of range"))?;
    Ok((&data[12..], count))
}

/// Read all entries of a final log-to-phys file.
pub fn read_final_l2p(path: &Path) -> Result<Vec<L2pEntry>> {
    let data = std::fs::read(path)?;
    let (body, count) = read_header(&data, L2P_MAGIC, path)?;
    if body.len() != count * 16 {
        return Err(FsError::corrupt(format!(
            "index file '{}': truncated body",
            path.display()
        )));
    }
    Ok(body
        .chunks_exact(16)
        .map(|record| L2pEntry {
            item: u64::from_le_bytes(record[0..8].try_into().expect("record slice")),
            offset: u64::from_le_bytes(record[8..16].try_into().expect("record slice")),
        })
        .collect())
}

/// Read all entries of a final phys-to-log file.
pub fn read_final_p2l(path: &Path) -> Result<Vec<P2lEntry>> {
    let data = std::fs::read(path)?;
    let (body, count) = read_header(&data, P2L_MAGIC, path)?;
    if body.len() != count * 25 {
        return Err(FsError::corrupt(format!(
            "index file '{}': truncated body",
            path.display()
        )));
    }
    body.chunks_exact(25)
        .map(|record| {
            Ok(P2lEntry {
                offset: u64::from_le_bytes(record[0..8].try_into().expect("record slice")),
                size: u64::from_le_bytes(record[8..16].try_into().expect("record slice")),
                item_type: ItemType::from_raw(record[16])?,
                item: u64::from_le_bytes(record[17..25].try_into().expect("record slice")),
            })
        })
        .collect()
}

// --- lookups ---

/// Offset of `item` within the revision file of `rev`.
pub fn l2p_lookup(fs: &FileSystem, rev: RevisionNumber, item: u64) -> Result<u64> {
    let entries = read_final_l2p(&fs.layout().l2p_file(rev))?;
    entries
        .binary_search_by_key(&item, |e| e.item)
        .map(|idx| entries[idx].offset)
        .map_err(|_| FsError::corrupt(format!("r{rev} has no item {item}")))
}

/// The phys-to-log entry starting at `offset` in the revision file of `rev`.
pub fn p2l_lookup(fs: &FileSystem, rev: RevisionNumber, offset: u64) -> Result<P2lEntry> {
    let entries = read_final_p2l(&fs.layout().p2l_file(rev))?;
    entries
        .binary_search_by_key(&offset, |e| e.offset)
        .map(|idx| entries[idx])
        .map_err(|_| FsError::corrupt(format!("r{rev} has no item at offset {offset}")))
}

/// Offset of `item` within the transaction's proto-rev file.
pub fn proto_l2p_lookup(fs: &FileSystem, txn_id: TxnId, item: u64) -> Result<u64> {
    read_l2p_proto(&fs.layout().txn_l2p_proto_index(txn_id))?
        .iter()
        .rev()
        .find(|e| e.item == item)
        .map(|e| e.offset)
        .ok_or_else(|| {
            FsError::corrupt(format!("transaction '{txn_id}' has no item {item}"))
        })
}

/// The proto phys-to-log entry starting at `offset`.
pub fn proto_p2l_lookup(fs: &FileSystem, txn_id: TxnId, offset: u64) -> Result<P2lEntry> {
    read_p2l_proto(&fs.layout().txn_p2l_proto_index(txn_id))?
        .iter()
        .rev()
        .find(|e| e.offset == offset)
        .copied()
        .ok_or_else(|| {
            FsError::corrupt(format!(
                "transaction '{txn_id}' has no item at offset {offset}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn final_l2p_round_trip_and_sorting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.l2p");
        let entries = vec![
            L2pEntry { item: 7, offset: 90 },
            L2pEntry { item: 2, offset: 0 },
            L2pEntry { item: 3, offset: 40 },
        ];
        write_final_l2p(&path, entries).unwrap();
        let read = read_final_l2p(&path).unwrap();
        assert_eq!(
            read.iter().map(|e| e.item).collect::<Vec<_>>(),
            vec![2, 3, 7]
        );
        assert_eq!(read[0].offset, 0);
    }

    #[test]
    fn final_p2l_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("3.p2l");
        let entries = vec![
            P2lEntry {
                offset: 100,
                size: 20,
                item_type: ItemType::Changes,
                item: 1,
            },
            P2lEntry {
                offset: 0,
                size: 100,
                item_type: ItemType::NodeRev,
                item: 2,
            },
        ];
        write_final_p2l(&path, entries.clone()).unwrap();
        let read = read_final_p2l(&path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], entries[1]);
        assert_eq!(read[1], entries[0]);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.l2p");
        std::fs::write(&path, b"NOPE\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(matches!(
            read_final_l2p(&path),
            Err(FsError::Corrupt { .. })
        ));
    }
}
