//! Node-revision storage.
//!
//! Transaction-staged node-revs live one-per-file in the transaction
//! directory and may be rewritten freely; committed node-revs are read out
//! of their revision file through the log-to-phys index.

use std::io::{BufReader, Seek, SeekFrom};

use fsvn_error::{FsError, Result};
use fsvn_types::{NodeRevId, NodeRevision};

use crate::fs::FileSystem;
use crate::index;
use crate::io;

/// Load the node-revision `id` refers to.
pub fn get_node_revision(fs: &FileSystem, id: &NodeRevId) -> Result<NodeRevision> {
    match id.noderev_id.change_set {
        fsvn_types::ChangeSet::Transaction(txn_id) => {
            let path = fs.layout().txn_node(txn_id, id.noderev_id.number);
            let file = std::fs::File::open(&path).map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    FsError::corrupt(format!("dangling node-revision reference '{id}'"))
                } else {
                    err.into()
                }
            })?;
            NodeRevision::parse(&mut BufReader::new(file))
        }
        fsvn_types::ChangeSet::Revision(rev) => {
            let offset = index::l2p_lookup(fs, rev, id.noderev_id.number)?;
            let mut file = std::fs::File::open(fs.layout().rev_file(rev))?;
            file.seek(SeekFrom::Start(offset))?;
            NodeRevision::parse(&mut BufReader::new(file))
        }
    }
}

/// Write a transaction-staged node-revision to its file.
pub fn put_node_revision(fs: &FileSystem, noderev: &NodeRevision) -> Result<()> {
    let Some(txn_id) = noderev.id.txn_id() else {
        return Err(FsError::malfunction(format!(
            "attempted to store node-revision '{}' outside a transaction",
            noderev.id
        )));
    };
    let path = fs.layout().txn_node(txn_id, noderev.id.noderev_id.number);
    io::write_atomic(&path, noderev.unparse().as_bytes())
}

/// Remove a staged node-revision file (used when a change is undone within
/// the transaction). Only transaction-tagged ids may be deleted.
pub fn delete_node_revision(fs: &FileSystem, id: &NodeRevId) -> Result<()> {
    let Some(txn_id) = id.txn_id() else {
        return Err(FsError::malfunction(format!(
            "attempted to delete committed node-revision '{id}'"
        )));
    };
    let item = id.noderev_id.number;
    io::remove_file_ignore_enoent(&fs.layout().txn_node(txn_id, item))?;
    io::remove_file_ignore_enoent(&fs.layout().txn_node_children(txn_id, item))?;
    io::remove_file_ignore_enoent(&fs.layout().txn_node_props(txn_id, item))
}
