//! Streaming representation writer for file contents.
//!
//! Bytes written here are checksummed (MD5 + SHA-1), delta-encoded against
//! the base chosen by [`crate::delta_base`], and appended to the
//! transaction's proto-rev file under the proto-rev lock. Closing the
//! writer finalizes digests, consults rep sharing (truncating the freshly
//! written bytes on a hit), stores the index entries, and rewrites the
//! node-rev to reference the new representation.
//!
//! If the writer is dropped without being closed, the proto-rev file is
//! truncated back to where this rep started and the lock is released, so a
//! failed write never leaves partial bytes behind.

use std::fs::File;
use std::io::{Seek, Write};

use md5::Digest as _;
use tracing::debug;

use fsvn_delta::DeltaEncoder;
use fsvn_error::{FsError, Result};
use fsvn_types::{ChangeSet, Md5, NodeKind, NodeRevision, RepId, Representation, Sha1, TxnId};

use crate::fs::{FileSystem, ProtoRevLock};
use crate::index::{self, ItemType, P2lEntry};
use crate::nodes;
use crate::rep_cache;
use crate::rep_read::{self, RepBase, RepHeader, ENDREP};
use crate::{delta_base, txn};

/// Open a content-writing stream for a file node-rev staged in a
/// transaction.
pub fn set_contents<'a>(fs: &'a FileSystem, noderev: NodeRevision) -> Result<RepWriter<'a>> {
    if noderev.kind != NodeKind::File {
        return Err(FsError::NotFile {
            path: noderev.created_path.clone(),
        });
    }
    RepWriter::new(fs, noderev)
}

/// In-flight representation write. See the module docs for the lifecycle.
pub struct RepWriter<'a> {
    fs: &'a FileSystem,
    txn_id: TxnId,
    noderev: NodeRevision,
    rep_offset: u64,
    delta_start: u64,
    /// Expanded (pre-delta) byte count.
    rep_size: u64,
    md5: md5::Md5,
    sha1: sha1::Sha1,
    encoder: Option<DeltaEncoder<File>>,
    lock: Option<ProtoRevLock>,
}

impl<'a> RepWriter<'a> {
    fn new(fs: &'a FileSystem, noderev: NodeRevision) -> Result<Self> {
        let Some(txn_id) = noderev.id.txn_id() else {
            return Err(FsError::corrupt(format!(
                "attempted to write to non-transaction '{}'",
                noderev.id
            )));
        };

        let (mut file, lock) = fs.writable_proto_rev(txn_id)?;
        // Dropping `lock` on any early exit below releases the advisory
        // lock and clears `being_written`; nothing has been appended yet,
        // so no truncation is needed until the header goes out.
        let rep_offset = file.stream_position()?;

        let base = delta_base::choose_delta_base(fs, &noderev, false)?;
        let source = rep_read::optional_rep_contents(fs, base.as_ref())?;

        let header = RepHeader {
            base: base
                .as_ref()
                .map(|base| -> Result<RepBase> {
                    Ok(RepBase {
                        rev: base.id.change_set.revision().ok_or_else(|| {
                            FsError::corrupt("delta base is not a committed representation")
                        })?,
                        item: base.id.number,
                        len: base.size,
                    })
                })
                .transpose()?,
        };
        if let Err(err) = file.write_all(header.unparse().as_bytes()) {
            truncate_proto_rev(fs, txn_id, rep_offset);
            drop(lock);
            return Err(err.into());
        }
        let delta_start = match file.stream_position() {
            Ok(pos) => pos,
            Err(err) => {
                truncate_proto_rev(fs, txn_id, rep_offset);
                drop(lock);
                return Err(err.into());
            }
        };

        let encoder = match DeltaEncoder::new(file, source) {
            Ok(encoder) => encoder,
            Err(err) => {
                truncate_proto_rev(fs, txn_id, rep_offset);
                drop(lock);
                return Err(err);
            }
        };

        Ok(Self {
            fs,
            txn_id,
            noderev,
            rep_offset,
            delta_start,
            rep_size: 0,
            md5: md5::Md5::new(),
            sha1: sha1::Sha1::new(),
            encoder: Some(encoder),
            lock: Some(lock),
        })
    }

    /// Append content bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.md5.update(data);
        self.sha1.update(data);
        self.rep_size += data.len() as u64;
        self.encoder
            .as_mut()
            .expect("writer used after close")
            .write(data)
    }

    /// Finish the representation and rewrite the node-rev to reference it.
    /// Returns the updated node-rev.
    pub fn close(mut self) -> Result<NodeRevision> {
        let encoder = self.encoder.take().expect("writer closed twice");
        let mut file = encoder.finish()?;
        let end_of_delta = file.stream_position()?;

        let mut rep = Representation {
            id: RepId {
                change_set: ChangeSet::Transaction(self.txn_id),
                number: 0,
            },
            size: end_of_delta - self.delta_start,
            expanded_size: self.rep_size,
            md5: Md5(self.md5.clone().finalize().into()),
            sha1: Some(Sha1(self.sha1.clone().finalize().into())),
        };

        let old_rep = rep_cache::get_shared_rep(self.fs, self.txn_id, &rep, None)?;
        match old_rep {
            Some(old) => {
                // Identical content already exists; erase what we just
                // wrote and reference the old rep.
                file.set_len(self.rep_offset)?;
                debug!(txn = %self.txn_id, sha1 = %old.sha1.as_ref().map_or_else(String::new, Sha1::hex), "rep shared");
                self.noderev.data_rep = Some(old);
            }
            None => {
                file.write_all(ENDREP)?;
                let item = txn::allocate_item_index(self.fs, self.txn_id)?;
                rep.id.number = item;
                index::store_l2p_proto_entry(self.fs, self.txn_id, self.rep_offset, item)?;
                let end = file.stream_position()?;
                index::store_p2l_proto_entry(
                    self.fs,
                    self.txn_id,
                    &P2lEntry {
                        offset: self.rep_offset,
                        size: end - self.rep_offset,
                        item_type: ItemType::FileRep,
                        item,
                    },
                )?;
                rep_cache::store_sha1_sidecar(self.fs, self.txn_id, &rep)?;
                self.noderev.data_rep = Some(rep);
            }
        }

        nodes::put_node_revision(self.fs, &self.noderev)?;

        drop(file);
        self.lock
            .take()
            .expect("proto-rev lock already released")
            .unlock()?;
        Ok(self.noderev.clone())
    }
}

impl Drop for RepWriter<'_> {
    fn drop(&mut self) {
        if self.lock.is_some() {
            // Abnormal exit: remove the partial rep, then let the lock's
            // own drop clear `being_written` and the advisory lock.
            drop(self.encoder.take());
            truncate_proto_rev(self.fs, self.txn_id, self.rep_offset);
        }
    }
}

/// Best-effort truncation of the proto-rev file back to `offset`.
fn truncate_proto_rev(fs: &FileSystem, txn_id: TxnId, offset: u64) {
    let path = fs.layout().txn_proto_rev(txn_id);
    if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
        let _ = file.set_len(offset);
    }
}
