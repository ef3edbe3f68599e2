//! On-disk path layout.
//!
//! Pure functions mapping revision numbers and transaction ids to paths
//! below the repository root. Nothing in here touches the filesystem.

use std::path::{Path, PathBuf};

use fsvn_types::{RevisionNumber, TxnId};

/// Suffix of per-transaction directories under `transactions/`.
pub const TXN_DIR_SUFFIX: &str = ".txn";

/// Path layout for one repository.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    /// Number of revisions per shard directory.
    shard_size: u32,
}

impl Layout {
    #[must_use]
    pub fn new(root: PathBuf, shard_size: u32) -> Self {
        debug_assert!(shard_size > 0);
        Self { root, shard_size }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn shard_of(&self, rev: RevisionNumber) -> u32 {
        rev.get() / self.shard_size
    }

    /// True if `rev` starts a new shard directory.
    #[must_use]
    pub fn starts_shard(&self, rev: RevisionNumber) -> bool {
        rev.get() % self.shard_size == 0
    }

    // --- repository-level files ---

    #[must_use]
    pub fn format_file(&self) -> PathBuf {
        self.root.join("format")
    }

    #[must_use]
    pub fn current_file(&self) -> PathBuf {
        self.root.join("current")
    }

    #[must_use]
    pub fn txn_current_file(&self) -> PathBuf {
        self.root.join("txn-current")
    }

    #[must_use]
    pub fn txn_current_lock_file(&self) -> PathBuf {
        self.root.join("txn-current-lock")
    }

    #[must_use]
    pub fn write_lock_file(&self) -> PathBuf {
        self.root.join("write-lock")
    }

    #[must_use]
    pub fn min_unpacked_rev_file(&self) -> PathBuf {
        self.root.join("min-unpacked-rev")
    }

    #[must_use]
    pub fn rep_cache_file(&self) -> PathBuf {
        self.root.join("rep-cache")
    }

    // --- revision data ---

    #[must_use]
    pub fn revs_dir(&self) -> PathBuf {
        self.root.join("revs")
    }

    #[must_use]
    pub fn rev_shard_dir(&self, rev: RevisionNumber) -> PathBuf {
        self.revs_dir().join(self.shard_of(rev).to_string())
    }

    /// Single-file pack of a whole shard. Recognized but never produced.
    #[must_use]
    pub fn pack_file(&self, shard: u32) -> PathBuf {
        self.revs_dir().join(format!("{shard}.pack")).join("pack")
    }

    #[must_use]
    pub fn rev_file(&self, rev: RevisionNumber) -> PathBuf {
        self.rev_shard_dir(rev).join(rev.get().to_string())
    }

    #[must_use]
    pub fn l2p_file(&self, rev: RevisionNumber) -> PathBuf {
        self.rev_shard_dir(rev).join(format!("{}.l2p", rev.get()))
    }

    #[must_use]
    pub fn p2l_file(&self, rev: RevisionNumber) -> PathBuf {
        self.rev_shard_dir(rev).join(format!("{}.p2l", rev.get()))
    }

    // --- revision properties ---

    #[must_use]
    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join("revprops")
    }

    #[must_use]
    pub fn revprops_shard_dir(&self, rev: RevisionNumber) -> PathBuf {
        self.revprops_dir().join(self.shard_of(rev).to_string())
    }

    #[must_use]
    pub fn revprops_file(&self, rev: RevisionNumber) -> PathBuf {
        self.revprops_shard_dir(rev).join(rev.get().to_string())
    }

    // --- transactions ---

    #[must_use]
    pub fn txns_dir(&self) -> PathBuf {
        self.root.join("transactions")
    }

    #[must_use]
    pub fn txn_dir(&self, txn: TxnId) -> PathBuf {
        self.txns_dir().join(format!("{}{TXN_DIR_SUFFIX}", txn.name()))
    }

    #[must_use]
    pub fn txn_proto_rev(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("rev")
    }

    #[must_use]
    pub fn txn_proto_rev_lock(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("rev-lock")
    }

    #[must_use]
    pub fn txn_changes(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("changes")
    }

    #[must_use]
    pub fn txn_next_ids(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("next-ids")
    }

    #[must_use]
    pub fn txn_item_index(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("item-index")
    }

    #[must_use]
    pub fn txn_props(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("props")
    }

    #[must_use]
    pub fn txn_props_final(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("props-final")
    }

    /// Per node-rev staging file. `item` is the node-rev id's item number,
    /// unique within the transaction.
    #[must_use]
    pub fn txn_node(&self, txn: TxnId, item: u64) -> PathBuf {
        self.txn_dir(txn)
            .join(format!("node.{}", fsvn_types::encoding::base36_encode(item)))
    }

    /// Append-only mutation log of one staged directory.
    #[must_use]
    pub fn txn_node_children(&self, txn: TxnId, item: u64) -> PathBuf {
        self.txn_dir(txn).join(format!(
            "node.{}.children",
            fsvn_types::encoding::base36_encode(item)
        ))
    }

    /// Staged property list of one node-rev.
    #[must_use]
    pub fn txn_node_props(&self, txn: TxnId, item: u64) -> PathBuf {
        self.txn_dir(txn).join(format!(
            "node.{}.props",
            fsvn_types::encoding::base36_encode(item)
        ))
    }

    /// Intra-transaction rep-sharing sidecar, named by SHA-1 hex digest.
    #[must_use]
    pub fn txn_sha1(&self, txn: TxnId, sha1: &fsvn_types::Sha1) -> PathBuf {
        self.txn_dir(txn).join(sha1.hex())
    }

    #[must_use]
    pub fn txn_l2p_proto_index(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("index.l2p")
    }

    #[must_use]
    pub fn txn_p2l_proto_index(&self, txn: TxnId) -> PathBuf {
        self.txn_dir(txn).join("index.p2l")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(PathBuf::from("/repo"), 1000)
    }

    #[test]
    fn sharding() {
        let l = layout();
        assert_eq!(l.shard_of(RevisionNumber(0)), 0);
        assert_eq!(l.shard_of(RevisionNumber(999)), 0);
        assert_eq!(l.shard_of(RevisionNumber(1000)), 1);
        assert!(l.starts_shard(RevisionNumber(0)));
        assert!(l.starts_shard(RevisionNumber(1000)));
        assert!(!l.starts_shard(RevisionNumber(1)));
    }

    #[test]
    fn revision_paths() {
        let l = layout();
        assert_eq!(
            l.rev_file(RevisionNumber(1001)),
            PathBuf::from("/repo/revs/1/1001")
        );
        assert_eq!(
            l.l2p_file(RevisionNumber(7)),
            PathBuf::from("/repo/revs/0/7.l2p")
        );
        assert_eq!(
            l.revprops_file(RevisionNumber(7)),
            PathBuf::from("/repo/revprops/0/7")
        );
        assert_eq!(l.pack_file(3), PathBuf::from("/repo/revs/3.pack/pack"));
    }

    #[test]
    fn transaction_paths() {
        let l = layout();
        let txn = TxnId(36);
        assert_eq!(l.txn_dir(txn), PathBuf::from("/repo/transactions/10.txn"));
        assert_eq!(
            l.txn_proto_rev(txn),
            PathBuf::from("/repo/transactions/10.txn/rev")
        );
        assert_eq!(
            l.txn_node_children(txn, 2),
            PathBuf::from("/repo/transactions/10.txn/node.2.children")
        );
    }
}
