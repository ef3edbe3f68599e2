//! Representation headers and content reconstruction.
//!
//! Every stored representation begins with a one-line header:
//!
//! ```text
//! DELTA\n                                  self-delta (empty base)
//! DELTA <base-rev> <base-item> <base-len>\n   delta against another rep
//! ```
//!
//! followed by the windowed-delta payload and the literal marker
//! `ENDREP\n`. Reconstruction expands the chain recursively; a chain that
//! does not terminate in a self-delta is corrupt.

use std::io::{Read, Seek, SeekFrom};

use fsvn_error::{FsError, Result};
use fsvn_types::{ChangeSet, Representation, RevisionNumber};

use crate::fs::FileSystem;
use crate::index;

/// Marker terminating every stored representation.
pub const ENDREP: &[u8] = b"ENDREP\n";

/// Parsed representation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepHeader {
    /// `None` for a self-delta.
    pub base: Option<RepBase>,
}

/// Delta-base pointer of a representation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepBase {
    pub rev: RevisionNumber,
    pub item: u64,
    /// On-disk payload length of the base, as recorded by the writer.
    pub len: u64,
}

impl RepHeader {
    #[must_use]
    pub fn unparse(&self) -> String {
        match self.base {
            None => "DELTA\n".to_owned(),
            Some(base) => format!("DELTA {} {} {}\n", base.rev, base.item, base.len),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n');
        if line == "DELTA" {
            return Ok(Self { base: None });
        }
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 4 || fields[0] != "DELTA" {
            return Err(FsError::corrupt(format!(
                "malformed representation header '{line}'"
            )));
        }
        let parse_u64 = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| FsError::corrupt(format!("malformed representation header '{line}'")))
        };
        Ok(Self {
            base: Some(RepBase {
                rev: fields[1].parse()?,
                item: parse_u64(fields[2])?,
                len: parse_u64(fields[3])?,
            }),
        })
    }
}

/// Raw bytes of one stored item: header line, payload, trailing `ENDREP`.
struct StoredRep {
    header: RepHeader,
    payload: Vec<u8>,
}

fn load_stored_rep(fs: &FileSystem, change_set: ChangeSet, item: u64) -> Result<StoredRep> {
    let (path, offset, size) = match change_set {
        ChangeSet::Revision(rev) => {
            let offset = index::l2p_lookup(fs, rev, item)?;
            let entry = index::p2l_lookup(fs, rev, offset)?;
            (fs.layout().rev_file(rev), offset, entry.size)
        }
        ChangeSet::Transaction(txn_id) => {
            let offset = index::proto_l2p_lookup(fs, txn_id, item)?;
            let entry = index::proto_p2l_lookup(fs, txn_id, offset)?;
            (fs.layout().txn_proto_rev(txn_id), offset, entry.size)
        }
    };

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = vec![0u8; usize::try_from(size).map_err(|_| {
        FsError::corrupt(format!("representation {change_set}/{item} too large"))
    })?];
    file.read_exact(&mut bytes)
        .map_err(|_| FsError::corrupt(format!("truncated representation {change_set}/{item}")))?;

    let header_end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| FsError::corrupt("representation header not terminated"))?;
    let header = RepHeader::parse(std::str::from_utf8(&bytes[..header_end]).map_err(|_| {
        FsError::corrupt("representation header is not valid UTF-8")
    })?)?;
    if !bytes.ends_with(ENDREP) {
        return Err(FsError::corrupt(format!(
            "representation {change_set}/{item} missing end marker"
        )));
    }
    let payload = bytes[header_end + 1..bytes.len() - ENDREP.len()].to_vec();
    Ok(StoredRep { header, payload })
}

const MAX_CHAIN_DEPTH: u32 = 10_000;

fn expand(fs: &FileSystem, change_set: ChangeSet, item: u64, depth: u32) -> Result<Vec<u8>> {
    if depth > MAX_CHAIN_DEPTH {
        return Err(FsError::corrupt(
            "representation delta chain does not terminate",
        ));
    }
    let stored = load_stored_rep(fs, change_set, item)?;
    let source = match stored.header.base {
        None => Vec::new(),
        Some(base) => expand(fs, ChangeSet::Revision(base.rev), base.item, depth + 1)?,
    };
    fsvn_delta::decode(&source, &stored.payload)
}

/// Fully expand the content of `rep`.
pub fn rep_contents(fs: &FileSystem, rep: &Representation) -> Result<Vec<u8>> {
    expand(fs, rep.id.change_set, rep.id.number, 0)
}

/// Expand the content of an optional rep; `None` is the empty stream.
pub fn optional_rep_contents(fs: &FileSystem, rep: Option<&Representation>) -> Result<Vec<u8>> {
    match rep {
        Some(rep) => rep_contents(fs, rep),
        None => Ok(Vec::new()),
    }
}

/// Number of delta links that must be applied to reconstruct `rep`,
/// including the representation itself.
pub fn rep_chain_length(fs: &FileSystem, rep: &Representation) -> Result<u32> {
    let mut length = 1u32;
    let mut cursor = (rep.id.change_set, rep.id.number);
    loop {
        let stored = load_stored_rep(fs, cursor.0, cursor.1)?;
        match stored.header.base {
            None => return Ok(length),
            Some(base) => {
                length += 1;
                if length > MAX_CHAIN_DEPTH {
                    return Err(FsError::corrupt(
                        "representation delta chain does not terminate",
                    ));
                }
                cursor = (ChangeSet::Revision(base.rev), base.item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_self_delta() {
        let header = RepHeader { base: None };
        assert_eq!(header.unparse(), "DELTA\n");
        assert_eq!(RepHeader::parse("DELTA\n").unwrap(), header);
    }

    #[test]
    fn header_round_trip_with_base() {
        let header = RepHeader {
            base: Some(RepBase {
                rev: RevisionNumber(4),
                item: 17,
                len: 1234,
            }),
        };
        assert_eq!(header.unparse(), "DELTA 4 17 1234\n");
        assert_eq!(RepHeader::parse(&header.unparse()).unwrap(), header);
    }

    #[test]
    fn malformed_headers_rejected() {
        assert!(RepHeader::parse("PLAIN").is_err());
        assert!(RepHeader::parse("DELTA 1 2").is_err());
        assert!(RepHeader::parse("DELTA x y z").is_err());
    }
}
