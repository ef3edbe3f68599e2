//! Public API facade for FrankenSVN.
//!
//! [`Repository`] wraps a filesystem handle with path-level convenience
//! operations; the underlying crates stay reachable (re-exported below)
//! for callers that need the raw engine.

pub use fsvn_error::{FsError, Result};
pub use fsvn_fs;
pub use fsvn_fs::{FsConfig, Transaction};
pub use fsvn_types as types;

use std::path::Path;

use fsvn_fs::revprops::PropList;
use fsvn_fs::{commit, mutation, rep_writer, tree, txn, FileSystem};
use fsvn_types::{ChangeKind, NodeKind, PathChange, RevisionNumber};

/// A repository on disk.
pub struct Repository {
    fs: FileSystem,
}

impl Repository {
    /// Create a new repository at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_config(path, FsConfig::default())
    }

    pub fn create_with_config(path: &Path, config: FsConfig) -> Result<Self> {
        Ok(Self {
            fs: FileSystem::create(path, config)?,
        })
    }

    /// Open an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, FsConfig::default())
    }

    pub fn open_with_config(path: &Path, config: FsConfig) -> Result<Self> {
        Ok(Self {
            fs: FileSystem::open(path, config)?,
        })
    }

    /// The underlying filesystem handle.
    #[must_use]
    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn youngest(&self) -> Result<RevisionNumber> {
        self.fs.youngest()
    }

    /// Begin a transaction based on the current youngest revision.
    pub fn begin(&self) -> Result<Txn<'_>> {
        let base = self.fs.youngest()?;
        self.begin_at(base)
    }

    /// Begin a transaction based on an explicit revision.
    pub fn begin_at(&self, base_rev: RevisionNumber) -> Result<Txn<'_>> {
        Ok(Txn {
            fs: &self.fs,
            txn: txn::begin_txn(&self.fs, base_rev)?,
        })
    }

    /// Re-attach to an on-disk transaction by name.
    pub fn open_txn(&self, name: &str) -> Result<Txn<'_>> {
        Ok(Txn {
            fs: &self.fs,
            txn: txn::open_txn(&self.fs, name)?,
        })
    }

    /// Read a file's contents at a committed revision.
    pub fn read_file(&self, rev: RevisionNumber, path: &str) -> Result<Vec<u8>> {
        let root = tree::revision_root(&self.fs, rev)?;
        let noderev = tree::node_at_path(&self.fs, &root, path)?;
        tree::file_contents(&self.fs, &noderev)
    }

    /// The canonical change map of a committed revision.
    pub fn changes(
        &self,
        rev: RevisionNumber,
    ) -> Result<std::collections::BTreeMap<String, PathChange>> {
        fsvn_fs::fold::paths_changed(&self.fs, rev)
    }

    /// Properties of a committed revision.
    pub fn revprops(&self, rev: RevisionNumber) -> Result<PropList> {
        fsvn_fs::revprops::read_revprops(&self.fs, rev)
    }

    /// All transactions with on-disk state, committed or stale.
    pub fn transactions(&self) -> Result<Vec<String>> {
        Ok(txn::list_transactions(&self.fs)?
            .into_iter()
            .map(|id| id.name())
            .collect())
    }

    /// Remove a stale transaction by name.
    pub fn purge_txn(&self, name: &str) -> Result<()> {
        let txn = txn::open_txn(&self.fs, name)?;
        txn::purge_txn(&self.fs, txn.txn_id)
    }
}

/// An open transaction with path-level staging operations.
pub struct Txn<'repo> {
    fs: &'repo FileSystem,
    txn: Transaction,
}

impl Txn<'_> {
    #[must_use]
    pub fn name(&self) -> String {
        self.txn.txn_id.name()
    }

    #[must_use]
    pub fn base_rev(&self) -> RevisionNumber {
        self.txn.base_rev
    }

    /// Create a file with the given contents and record the `add`.
    pub fn add_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let node = mutation::make_node(self.fs, self.txn.txn_id, path, NodeKind::File)?;
        let mut writer = rep_writer::set_contents(self.fs, node)?;
        writer.write(contents)?;
        writer.close()?;
        Ok(())
    }

    /// Create an empty directory and record the `add`.
    pub fn add_dir(&self, path: &str) -> Result<()> {
        mutation::make_node(self.fs, self.txn.txn_id, path, NodeKind::Dir)?;
        Ok(())
    }

    /// Replace an existing file's contents and record the `modify`.
    pub fn modify_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let node = mutation::make_path_mutable(self.fs, self.txn.txn_id, path)?;
        let mut writer = rep_writer::set_contents(self.fs, node)?;
        writer.write(contents)?;
        let node = writer.close()?;
        mutation::add_change(
            self.fs,
            self.txn.txn_id,
            path,
            &PathChange {
                kind: ChangeKind::Modify,
                node_rev_id: Some(node.id),
                text_mod: true,
                prop_mod: false,
                node_kind: Some(NodeKind::File),
                copyfrom: None,
            },
        )
    }

    /// Delete the node at `path` and record the `delete`.
    pub fn delete(&self, path: &str) -> Result<()> {
        mutation::delete_node(self.fs, self.txn.txn_id, path)
    }

    /// Stage only the destination half of a move (the source deletion is a
    /// separate, mandatory step; commit rejects a move whose source
    /// survives).
    pub fn stage_move(&self, from: &str, to: &str) -> Result<()> {
        mutation::stage_move(self.fs, self.txn.txn_id, self.txn.base_rev, from, to)?;
        Ok(())
    }

    /// Move a node: stage the destination and delete the source.
    pub fn move_node(&self, from: &str, to: &str) -> Result<()> {
        self.stage_move(from, to)?;
        self.delete(from)
    }

    /// Replace the properties of the node at `path`.
    pub fn set_node_props(&self, path: &str, props: &PropList) -> Result<()> {
        let mut node = mutation::make_path_mutable(self.fs, self.txn.txn_id, path)?;
        mutation::set_proplist(self.fs, &mut node, props)?;
        mutation::add_change(
            self.fs,
            self.txn.txn_id,
            path,
            &PathChange {
                kind: ChangeKind::Modify,
                node_rev_id: Some(node.id),
                text_mod: false,
                prop_mod: true,
                node_kind: Some(node.kind),
                copyfrom: None,
            },
        )
    }

    /// Set (or with `None` remove) a transaction property.
    pub fn set_txn_prop(&self, name: &str, value: Option<&[u8]>) -> Result<()> {
        txn::change_txn_props(
            self.fs,
            self.txn.txn_id,
            &[(name.to_owned(), value.map(<[u8]>::to_vec))],
            false,
        )
    }

    /// Promote this transaction into the next revision.
    ///
    /// On `TxnOutOfDate` the transaction stays on disk for retry or
    /// purging.
    pub fn commit(self) -> Result<RevisionNumber> {
        commit::commit(self.fs, &self.txn)
    }

    /// Abort: remove all on-disk and in-process state of this transaction.
    pub fn abort(self) -> Result<()> {
        txn::abort_txn(self.fs, self.txn.txn_id)
    }

    /// The underlying transaction record.
    #[must_use]
    pub fn raw(&self) -> Transaction {
        self.txn
    }
}
