//! Reading the versioned tree: revision roots, directory listings, file
//! contents and property lists.
//!
//! Directory listings come from three places depending on the node-rev:
//! a transaction-mutable directory replays its append-only mutation log
//! over the base snapshot, an immutable directory expands its stored
//! representation, and a node-rev without a data rep is simply empty.

use std::collections::BTreeMap;
use std::io::BufReader;

use md5::Digest as _;

use fsvn_error::{FsError, Result};
use fsvn_types::encoding::{read_hash, read_hash_entries, HashEntry};
use fsvn_types::id::ITEM_INDEX_ROOT_NODE;
use fsvn_types::{
    fspath, ChangeSet, DirEntry, Md5, NodeKind, NodeRevId, NodeRevision, RevisionNumber, TxnId,
};

use crate::fs::FileSystem;
use crate::index;
use crate::nodes;
use crate::rep_read;
use crate::revprops::PropList;

/// The root node-revision of committed revision `rev`.
pub fn revision_root(fs: &FileSystem, rev: RevisionNumber) -> Result<NodeRevision> {
    let cs = ChangeSet::Revision(rev);
    // The root's noderev id always sits at the well-known root item index.
    let offset = index::l2p_lookup(fs, rev, ITEM_INDEX_ROOT_NODE)?;
    let mut file = std::fs::File::open(fs.layout().rev_file(rev))?;
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(offset))?;
    let noderev = NodeRevision::parse(&mut BufReader::new(file))?;
    if noderev.id.noderev_id.change_set != cs {
        return Err(FsError::corrupt(format!(
            "root node-revision of r{rev} carries id '{}'",
            noderev.id
        )));
    }
    Ok(noderev)
}

/// The staged root node-revision of a transaction.
pub fn txn_root(fs: &FileSystem, txn_id: TxnId) -> Result<NodeRevision> {
    nodes::get_node_revision(fs, &NodeRevId::txn_root(txn_id))
}

/// List the entries of a directory node-rev.
pub fn dir_entries(
    fs: &FileSystem,
    noderev: &NodeRevision,
) -> Result<BTreeMap<String, DirEntry>> {
    if noderev.kind != NodeKind::Dir {
        return Err(FsError::NotDir {
            path: noderev.created_path.clone(),
        });
    }
    if let Some(cached) = fs.dir_cache_get(&noderev.id) {
        return Ok(cached);
    }

    let entries = match &noderev.data_rep {
        None => BTreeMap::new(),
        Some(rep) if rep.is_mutable() => {
            let txn_id = noderev
                .id
                .txn_id()
                .ok_or_else(|| FsError::malfunction("mutable dir rep on committed node-rev"))?;
            let path = fs
                .layout()
                .txn_node_children(txn_id, noderev.id.noderev_id.number);
            let file = std::fs::File::open(path)?;
            let mut reader = BufReader::new(file);
            // Base snapshot up to END, then the incremental tail.
            let mut entries = parse_entries(read_hash(&mut reader)?)?;
            let (tail, _) = read_hash_entries(&mut reader)?;
            for entry in tail {
                match entry {
                    HashEntry::Set(name, value) => {
                        let value = String::from_utf8(value)
                            .map_err(|_| FsError::corrupt("directory entry is not valid UTF-8"))?;
                        entries.insert(name, DirEntry::parse(&value)?);
                    }
                    HashEntry::Delete(name) => {
                        entries.remove(&name);
                    }
                }
            }
            entries
        }
        Some(rep) => parse_entries({
            let bytes = rep_read::rep_contents(fs, rep)?;
            read_hash(&mut bytes.as_slice())?
        })?,
    };

    fs.dir_cache_set(noderev.id, entries.clone());
    Ok(entries)
}

fn parse_entries(raw: BTreeMap<String, Vec<u8>>) -> Result<BTreeMap<String, DirEntry>> {
    raw.into_iter()
        .map(|(name, value)| {
            let value = String::from_utf8(value)
                .map_err(|_| FsError::corrupt("directory entry is not valid UTF-8"))?;
            Ok((name, DirEntry::parse(&value)?))
        })
        .collect()
}

/// Walk `path` down from `root` and return the node-revision at it.
pub fn node_at_path(fs: &FileSystem, root: &NodeRevision, path: &str) -> Result<NodeRevision> {
    let rev = root
        .id
        .revision()
        .unwrap_or(RevisionNumber(u32::MAX));
    let Some(rest) = fspath::skip_ancestor("/", path) else {
        return Err(FsError::PathNotFound {
            path: path.to_owned(),
            rev: rev.get(),
        });
    };
    let mut current = root.clone();
    if rest.is_empty() {
        return Ok(current);
    }
    for component in rest.split('/') {
        let entries = dir_entries(fs, &current)?;
        let entry = entries.get(component).ok_or_else(|| FsError::PathNotFound {
            path: path.to_owned(),
            rev: rev.get(),
        })?;
        current = nodes::get_node_revision(fs, &entry.id)?;
    }
    Ok(current)
}

/// Fully expanded contents of a file node-rev, verified against its MD5.
pub fn file_contents(fs: &FileSystem, noderev: &NodeRevision) -> Result<Vec<u8>> {
    if noderev.kind != NodeKind::File {
        return Err(FsError::NotFile {
            path: noderev.created_path.clone(),
        });
    }
    let Some(rep) = &noderev.data_rep else {
        return Ok(Vec::new());
    };
    let contents = rep_read::rep_contents(fs, rep)?;
    let actual = Md5(md5::Md5::digest(&contents).into());
    if actual != rep.md5 {
        return Err(FsError::ChecksumMismatch {
            item: format!("contents of '{}'", noderev.created_path),
            expected: rep.md5.hex(),
            actual: actual.hex(),
        });
    }
    Ok(contents)
}

/// Property list of a node-rev.
pub fn proplist(fs: &FileSystem, noderev: &NodeRevision) -> Result<PropList> {
    match &noderev.prop_rep {
        None => Ok(PropList::new()),
        Some(rep) if rep.is_mutable() => {
            let txn_id = noderev
                .id
                .txn_id()
                .ok_or_else(|| FsError::malfunction("mutable prop rep on committed node-rev"))?;
            let path = fs
                .layout()
                .txn_node_props(txn_id, noderev.id.noderev_id.number);
            let file = std::fs::File::open(path)?;
            read_hash(&mut BufReader::new(file))
        }
        Some(rep) => {
            let bytes = rep_read::rep_contents(fs, rep)?;
            read_hash(&mut bytes.as_slice())
        }
    }
}
