//! The mutation buffer: staging tree changes inside a transaction.
//!
//! All mutations land in per-transaction scratch files. Directories get an
//! append-only mutation log (materialized from the base listing on first
//! touch); every staged change also appends one record to the transaction's
//! changes log.

use std::collections::BTreeMap;

use md5::Digest as _;

use fsvn_error::{FsError, Result};
use fsvn_types::encoding::{write_hash, write_hash_delete, write_hash_set};
use fsvn_types::id::ITEM_INDEX_UNUSED;
use fsvn_types::{
    fspath, ChangeKind, ChangeSet, DirEntry, IdPart, Md5, NodeKind, NodeRevision, PathChange,
    RepId, Representation, RevisionNumber, TxnId,
};

use crate::fs::FileSystem;
use crate::io;
use crate::nodes;
use crate::revprops::PropList;
use crate::tree;
use crate::txn;

fn md5_of(bytes: &[u8]) -> Md5 {
    Md5(md5::Md5::digest(bytes).into())
}

/// A fresh mutable representation placeholder. The real size, digests and
/// item index are filled in when the rep is written out.
fn mutable_rep_placeholder(txn_id: TxnId, number: u64) -> Representation {
    Representation {
        id: RepId {
            change_set: ChangeSet::Transaction(txn_id),
            number,
        },
        size: 0,
        expanded_size: 0,
        md5: md5_of(b""),
        sha1: None,
    }
}

/// Set or delete directory entry `name` of `parent`.
///
/// On the first mutation of a directory its current listing is dumped as
/// the base snapshot of the mutation log and the directory's data rep is
/// marked mutable; afterwards each call appends one log record. The
/// in-memory directory cache is updated by partial replacement.
pub fn set_entry(
    fs: &FileSystem,
    txn_id: TxnId,
    parent: &mut NodeRevision,
    name: &str,
    entry: Option<DirEntry>,
) -> Result<()> {
    if parent.kind != NodeKind::Dir {
        return Err(FsError::NotDir {
            path: parent.created_path.clone(),
        });
    }
    let log_path = fs
        .layout()
        .txn_node_children(txn_id, parent.id.noderev_id.number);

    let mutable = parent
        .data_rep
        .as_ref()
        .is_some_and(Representation::is_mutable);
    let mut log = if mutable {
        io::open_append(&log_path)?
    } else {
        // Materialize: dump the current listing as the base snapshot, then
        // mark the data rep mutable.
        let entries = tree::dir_entries(fs, parent)?;
        let serialized: BTreeMap<String, Vec<u8>> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.unparse().into_bytes()))
            .collect();
        let mut file = std::fs::File::create(&log_path)?;
        write_hash(&mut file, &serialized)?;

        parent.data_rep = Some(mutable_rep_placeholder(txn_id, ITEM_INDEX_UNUSED));
        nodes::put_node_revision(fs, parent)?;
        io::open_append(&log_path)?
    };

    match &entry {
        Some(entry) => write_hash_set(&mut log, name, entry.unparse().as_bytes())?,
        None => write_hash_delete(&mut log, name)?,
    }

    fs.dir_cache_replace(&parent.id, name, entry);
    Ok(())
}

/// Append one change record to the transaction's changes log.
pub fn add_change(fs: &FileSystem, txn_id: TxnId, path: &str, change: &PathChange) -> Result<()> {
    let mut log = io::open_append(&fs.layout().txn_changes(txn_id))?;
    write_hash_set(&mut log, path, change.unparse().as_bytes())
}

/// Replace the property list of a staged node-rev.
pub fn set_proplist(fs: &FileSystem, noderev: &mut NodeRevision, props: &PropList) -> Result<()> {
    let Some(txn_id) = noderev.id.txn_id() else {
        return Err(FsError::malfunction(format!(
            "attempted to set properties of committed node-revision '{}'",
            noderev.id
        )));
    };
    let path = fs
        .layout()
        .txn_node_props(txn_id, noderev.id.noderev_id.number);
    let mut buf = Vec::new();
    write_hash(&mut buf, props)?;
    io::write_atomic(&path, &buf)?;

    if !noderev
        .prop_rep
        .as_ref()
        .is_some_and(Representation::is_mutable)
    {
        let item = txn::allocate_item_index(fs, txn_id)?;
        noderev.prop_rep = Some(mutable_rep_placeholder(txn_id, item));
        nodes::put_node_revision(fs, noderev)?;
    }
    Ok(())
}

/// Mint a brand-new node in the transaction.
pub fn create_node(
    fs: &FileSystem,
    txn_id: TxnId,
    kind: NodeKind,
    created_path: &str,
    copy_id: IdPart,
) -> Result<NodeRevision> {
    let node_id = txn::reserve_node_id(fs, txn_id)?;
    let item = txn::allocate_item_index(fs, txn_id)?;
    let noderev = NodeRevision {
        id: fsvn_types::NodeRevId::new(
            node_id,
            copy_id,
            IdPart::new(ChangeSet::Transaction(txn_id), item),
        ),
        kind,
        predecessor_id: None,
        predecessor_count: 0,
        data_rep: None,
        prop_rep: None,
        created_path: created_path.to_owned(),
        copyfrom: None,
        copyroot: None,
        mergeinfo_count: 0,
        has_mergeinfo: false,
        is_fresh_txn_root: false,
    };
    nodes::put_node_revision(fs, &noderev)?;
    Ok(noderev)
}

/// Mint the transaction-local successor of a committed node-rev: same node
/// and copy lineage, fresh item index, predecessor chain extended by one.
pub fn create_successor(
    fs: &FileSystem,
    txn_id: TxnId,
    old: &NodeRevision,
    created_path: &str,
) -> Result<NodeRevision> {
    let item = txn::allocate_item_index(fs, txn_id)?;
    let mut new = old.clone();
    new.id = fsvn_types::NodeRevId::new(
        old.id.node_id,
        old.id.copy_id,
        IdPart::new(ChangeSet::Transaction(txn_id), item),
    );
    new.predecessor_id = Some(old.id);
    new.predecessor_count = old.predecessor_count + 1;
    new.created_path = created_path.to_owned();
    new.copyfrom = None;
    new.is_fresh_txn_root = false;
    nodes::put_node_revision(fs, &new)?;
    Ok(new)
}

// --- path-level staging helpers ---

/// Return a mutable (transaction-staged) node-rev for `path`, cloning the
/// node and any committed ancestors into the transaction as needed.
pub fn make_path_mutable(fs: &FileSystem, txn_id: TxnId, path: &str) -> Result<NodeRevision> {
    if fspath::is_root(path) {
        return tree::txn_root(fs, txn_id);
    }
    let (parent_path, name) = fspath::split(path)
        .ok_or_else(|| FsError::malfunction(format!("uncanonical path '{path}'")))?;
    let mut parent = make_path_mutable(fs, txn_id, parent_path)?;
    let entries = tree::dir_entries(fs, &parent)?;
    let entry = entries.get(name).ok_or_else(|| FsError::PathNotFound {
        path: path.to_owned(),
        rev: 0,
    })?;
    let child = nodes::get_node_revision(fs, &entry.id)?;
    if child.id.is_txn() {
        return Ok(child);
    }
    let new = create_successor(fs, txn_id, &child, path)?;
    set_entry(
        fs,
        txn_id,
        &mut parent,
        name,
        Some(DirEntry {
            kind: new.kind,
            id: new.id,
        }),
    )?;
    Ok(new)
}

fn mutable_parent_of<'p>(
    fs: &FileSystem,
    txn_id: TxnId,
    path: &'p str,
) -> Result<(NodeRevision, &'p str)> {
    let (parent_path, name) = fspath::split(path)
        .ok_or_else(|| FsError::malfunction(format!("uncanonical path '{path}'")))?;
    Ok((make_path_mutable(fs, txn_id, parent_path)?, name))
}

/// Create an empty node at `path` and record the `add` change.
pub fn make_node(
    fs: &FileSystem,
    txn_id: TxnId,
    path: &str,
    kind: NodeKind,
) -> Result<NodeRevision> {
    let (mut parent, name) = mutable_parent_of(fs, txn_id, path)?;
    if tree::dir_entries(fs, &parent)?.contains_key(name) {
        return Err(FsError::AlreadyExists {
            path: path.to_owned(),
        });
    }
    let node = create_node(fs, txn_id, kind, path, parent.id.copy_id)?;
    set_entry(
        fs,
        txn_id,
        &mut parent,
        name,
        Some(DirEntry {
            kind,
            id: node.id,
        }),
    )?;
    add_change(
        fs,
        txn_id,
        path,
        &PathChange {
            kind: ChangeKind::Add,
            node_rev_id: Some(node.id),
            text_mod: kind == NodeKind::File,
            prop_mod: false,
            node_kind: Some(kind),
            copyfrom: None,
        },
    )?;
    Ok(node)
}

/// Remove the entry at `path` and record the `delete` change.
pub fn delete_node(fs: &FileSystem, txn_id: TxnId, path: &str) -> Result<()> {
    let (mut parent, name) = mutable_parent_of(fs, txn_id, path)?;
    let entries = tree::dir_entries(fs, &parent)?;
    let entry = entries.get(name).ok_or_else(|| FsError::PathNotFound {
        path: path.to_owned(),
        rev: 0,
    })?;
    let entry_id = entry.id;
    let node_kind = entry.kind;
    set_entry(fs, txn_id, &mut parent, name, None)?;
    if entry_id.is_txn() {
        nodes::delete_node_revision(fs, &entry_id)?;
    }
    add_change(
        fs,
        txn_id,
        path,
        &PathChange {
            kind: ChangeKind::Delete,
            node_rev_id: Some(entry_id),
            text_mod: false,
            prop_mod: false,
            node_kind: Some(node_kind),
            copyfrom: None,
        },
    )?;
    Ok(())
}

/// Stage the destination side of a move: `to` becomes a branch of the node
/// at `from` in the base revision, and a `move` change is recorded with the
/// source as copy-from.
///
/// A complete move also deletes `from`; commit-time move verification
/// rejects the transaction otherwise.
pub fn stage_move(
    fs: &FileSystem,
    txn_id: TxnId,
    base_rev: RevisionNumber,
    from: &str,
    to: &str,
) -> Result<NodeRevision> {
    let base_root = tree::revision_root(fs, base_rev)?;
    let source = tree::node_at_path(fs, &base_root, from)?;

    let (mut parent, name) = mutable_parent_of(fs, txn_id, to)?;
    if tree::dir_entries(fs, &parent)?.contains_key(name) {
        return Err(FsError::AlreadyExists {
            path: to.to_owned(),
        });
    }

    let copy_id = txn::reserve_copy_id(fs, txn_id)?;
    let item = txn::allocate_item_index(fs, txn_id)?;
    let mut moved = source.clone();
    moved.id = fsvn_types::NodeRevId::new(
        source.id.node_id,
        copy_id,
        IdPart::new(ChangeSet::Transaction(txn_id), item),
    );
    moved.predecessor_id = Some(source.id);
    moved.predecessor_count = source.predecessor_count + 1;
    moved.created_path = to.to_owned();
    moved.copyfrom = Some((base_rev, from.to_owned()));
    moved.copyroot = None;
    moved.is_fresh_txn_root = false;
    nodes::put_node_revision(fs, &moved)?;

    set_entry(
        fs,
        txn_id,
        &mut parent,
        name,
        Some(DirEntry {
            kind: moved.kind,
            id: moved.id,
        }),
    )?;
    add_change(
        fs,
        txn_id,
        to,
        &PathChange {
            kind: ChangeKind::Move,
            node_rev_id: Some(moved.id),
            text_mod: false,
            prop_mod: false,
            node_kind: Some(moved.kind),
            copyfrom: Some((base_rev, from.to_owned())),
        },
    )?;
    Ok(moved)
}
