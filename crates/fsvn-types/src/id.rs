//! Transaction ids, the tagged change-set, and node-revision ids.

use std::fmt;

use fsvn_error::FsError;

use crate::RevisionNumber;
use crate::encoding::{base36_decode, base36_encode};

/// Item index of the changed-paths block within every change set.
pub const ITEM_INDEX_CHANGES: u64 = 1;
/// Item index of the root node-revision within every change set.
pub const ITEM_INDEX_ROOT_NODE: u64 = 2;
/// First item index handed out by `allocate_item_index`.
pub const ITEM_INDEX_FIRST_USER: u64 = 3;
/// Sentinel for representations that have not been assigned an item yet
/// (mutable directory reps carry this until commit).
pub const ITEM_INDEX_UNUSED: u64 = 0;

/// A transaction id, allocated from the repository-wide `txn-current`
/// sequence. Serialized as base-36 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// The base-36 name used in directory names and id parts.
    #[must_use]
    pub fn name(self) -> String {
        base36_encode(self.0)
    }

    /// Parse a base-36 transaction name.
    pub fn from_name(name: &str) -> Result<Self, FsError> {
        base36_decode(name)
            .map(Self)
            .ok_or_else(|| FsError::corrupt(format!("invalid transaction name '{name}'")))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A change set: the tag that namespaces item indexes.
///
/// Either a committed revision or an in-progress transaction. The compact
/// on-disk form is a tagged `u64` with the high bit discriminating; the
/// textual form is `r<decimal>` / `t<base36>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSet {
    Revision(RevisionNumber),
    Transaction(TxnId),
}

const TXN_TAG: u64 = 1 << 63;

impl ChangeSet {
    /// True if this change set names an in-progress transaction.
    ///
    /// A representation or id part tagged with a transaction is mutable;
    /// one tagged with a revision is immutable.
    #[inline]
    #[must_use]
    pub const fn is_txn(self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    /// The revision, if committed.
    #[inline]
    #[must_use]
    pub const fn revision(self) -> Option<RevisionNumber> {
        match self {
            Self::Revision(rev) => Some(rev),
            Self::Transaction(_) => None,
        }
    }

    /// The transaction id, if in progress.
    #[inline]
    #[must_use]
    pub const fn txn_id(self) -> Option<TxnId> {
        match self {
            Self::Revision(_) => None,
            Self::Transaction(txn) => Some(txn),
        }
    }

    /// Compact tagged encoding. The high bit marks a transaction; the
    /// remaining bits carry the numeric value.
    #[must_use]
    pub const fn to_tagged(self) -> u64 {
        match self {
            Self::Revision(rev) => rev.0 as u64,
            Self::Transaction(txn) => TXN_TAG | txn.0,
        }
    }

    /// Decode the compact tagged encoding.
    pub fn from_tagged(raw: u64) -> Result<Self, FsError> {
        if raw & TXN_TAG == 0 {
            u32::try_from(raw)
                .map(|rev| Self::Revision(RevisionNumber(rev)))
                .map_err(|_| FsError::corrupt(format!("change set value {raw} out of range")))
        } else {
            Ok(Self::Transaction(TxnId(raw & !TXN_TAG)))
        }
    }

    /// Parse the textual form (`r<decimal>` / `t<base36>`).
    pub fn parse(s: &str) -> Result<Self, FsError> {
        if let Some(rest) = s.strip_prefix('r') {
            rest.parse().map(Self::Revision)
        } else if let Some(rest) = s.strip_prefix('t') {
            TxnId::from_name(rest).map(Self::Transaction)
        } else {
            Err(FsError::corrupt(format!("invalid change set '{s}'")))
        }
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revision(rev) => write!(f, "r{rev}"),
            Self::Transaction(txn) => write!(f, "t{txn}"),
        }
    }
}

/// One component of a node-revision id: a number scoped to a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdPart {
    pub change_set: ChangeSet,
    pub number: u64,
}

impl IdPart {
    #[must_use]
    pub const fn new(change_set: ChangeSet, number: u64) -> Self {
        Self { change_set, number }
    }

    /// Rewrite a transaction-tagged part to the given revision. Parts that
    /// already carry a revision are left alone; they predate this commit.
    pub fn finalize(&mut self, rev: RevisionNumber) {
        if self.change_set.is_txn() {
            self.change_set = ChangeSet::Revision(rev);
        }
    }

    /// Parse the textual form `<change-set>-<base36-number>`.
    pub fn parse(s: &str) -> Result<Self, FsError> {
        let (cs, num) = s
            .rsplit_once('-')
            .ok_or_else(|| FsError::corrupt(format!("invalid id part '{s}'")))?;
        Ok(Self {
            change_set: ChangeSet::parse(cs)?,
            number: base36_decode(num)
                .ok_or_else(|| FsError::corrupt(format!("invalid id part number '{num}'")))?,
        })
    }
}

impl fmt::Display for IdPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.change_set, base36_encode(self.number))
    }
}

/// A full node-revision id: node identity, copy lineage, per-revision handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    /// Identifies the logical node across revisions.
    pub node_id: IdPart,
    /// Tracks branch (copy) lineage.
    pub copy_id: IdPart,
    /// The per-revision handle; its number doubles as the item index of the
    /// serialized node-revision.
    pub noderev_id: IdPart,
}

impl NodeRevId {
    #[must_use]
    pub const fn new(node_id: IdPart, copy_id: IdPart, noderev_id: IdPart) -> Self {
        Self {
            node_id,
            copy_id,
            noderev_id,
        }
    }

    /// The id of the root node of transaction `txn`: node 0, copy 0,
    /// noderev pinned at the well-known root item index.
    #[must_use]
    pub const fn txn_root(txn: TxnId) -> Self {
        let cs = ChangeSet::Transaction(txn);
        Self {
            node_id: IdPart::new(cs, 0),
            copy_id: IdPart::new(cs, 0),
            noderev_id: IdPart::new(cs, ITEM_INDEX_ROOT_NODE),
        }
    }

    /// True if any component is tagged with a transaction.
    #[must_use]
    pub const fn is_txn(&self) -> bool {
        self.noderev_id.change_set.is_txn()
    }

    /// The transaction this id belongs to, if any.
    #[must_use]
    pub const fn txn_id(&self) -> Option<TxnId> {
        self.noderev_id.change_set.txn_id()
    }

    /// The revision this id was committed in, if any.
    #[must_use]
    pub const fn revision(&self) -> Option<RevisionNumber> {
        self.noderev_id.change_set.revision()
    }

    /// Rewrite all transaction-tagged components to `rev`.
    pub fn finalize(&mut self, rev: RevisionNumber) {
        self.node_id.finalize(rev);
        self.copy_id.finalize(rev);
        self.noderev_id.finalize(rev);
    }

    /// Parse the textual form `<node>.<copy>.<noderev>`.
    pub fn parse(s: &str) -> Result<Self, FsError> {
        let mut parts = s.split('.');
        let (Some(node), Some(copy), Some(noderev), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(FsError::corrupt(format!("invalid node-revision id '{s}'")));
        };
        Ok(Self {
            node_id: IdPart::parse(node)?,
            copy_id: IdPart::parse(copy)?,
            noderev_id: IdPart::parse(noderev)?,
        })
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.node_id, self.copy_id, self.noderev_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_name_round_trip() {
        assert_eq!(TxnId(0).name(), "0");
        assert_eq!(TxnId(35).name(), "z");
        assert_eq!(TxnId(36).name(), "10");
        assert_eq!(TxnId::from_name("10").unwrap(), TxnId(36));
        assert!(TxnId::from_name("").is_err());
        assert!(TxnId::from_name("A!").is_err());
    }

    #[test]
    fn change_set_tagged_round_trip() {
        let rev = ChangeSet::Revision(RevisionNumber(42));
        let txn = ChangeSet::Transaction(TxnId(7));
        assert_eq!(ChangeSet::from_tagged(rev.to_tagged()).unwrap(), rev);
        assert_eq!(ChangeSet::from_tagged(txn.to_tagged()).unwrap(), txn);
        assert!(!rev.is_txn());
        assert!(txn.is_txn());
    }

    #[test]
    fn change_set_text_round_trip() {
        assert_eq!(
            ChangeSet::parse("r17").unwrap(),
            ChangeSet::Revision(RevisionNumber(17))
        );
        assert_eq!(
            ChangeSet::parse("tz").unwrap(),
            ChangeSet::Transaction(TxnId(35))
        );
        assert!(ChangeSet::parse("x3").is_err());
        assert!(ChangeSet::parse("").is_err());
    }

    #[test]
    fn node_rev_id_round_trip() {
        let id = NodeRevId::txn_root(TxnId(4));
        let text = id.to_string();
        assert_eq!(text, "t4-0.t4-0.t4-2");
        assert_eq!(NodeRevId::parse(&text).unwrap(), id);
    }

    #[test]
    fn finalize_rewrites_only_txn_parts() {
        let mut id = NodeRevId::txn_root(TxnId(4));
        id.node_id = IdPart::new(ChangeSet::Revision(RevisionNumber(1)), 0);
        id.finalize(RevisionNumber(9));
        assert_eq!(
            id.node_id.change_set,
            ChangeSet::Revision(RevisionNumber(1))
        );
        assert_eq!(
            id.noderev_id.change_set,
            ChangeSet::Revision(RevisionNumber(9))
        );
    }
}
