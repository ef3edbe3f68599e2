//! Transaction lifecycle and per-transaction id allocation.

use std::io::BufReader;

use tracing::debug;

use fsvn_error::{FsError, Result};
use fsvn_types::encoding::{base36_decode, base36_encode, read_hash};
use fsvn_types::id::ITEM_INDEX_FIRST_USER;
use fsvn_types::{ChangeSet, IdPart, NodeRevId, RevisionNumber, TxnId};

use crate::fs::FileSystem;
use crate::io;
use crate::layout::TXN_DIR_SUFFIX;
use crate::nodes;
use crate::revprops::{serialize_props, PropList, PROP_REVISION_DATE, PROP_TXN_CLIENT_DATE};
use crate::tree;

/// An open transaction handle.
///
/// The handle is deliberately small: all state lives on disk under the
/// transaction directory, so a transaction survives its handle (and its
/// process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub txn_id: TxnId,
    /// The revision this transaction is based on. Commit will fail with
    /// `TxnOutOfDate` unless this is still the youngest revision.
    pub base_rev: RevisionNumber,
}

/// Begin a transaction against `base_rev`.
///
/// Mints a fresh transaction id from the `txn-current` counter, creates
/// the transaction directory with its empty proto-rev, lock, changes and
/// `next-ids` files, and stages a copy of the base revision's root
/// node-rev as the transaction root.
pub fn begin_txn(fs: &FileSystem, base_rev: RevisionNumber) -> Result<Transaction> {
    let txn_id = fs.with_txn_current_lock(|| get_and_increment_txn_key(fs))?;
    let layout = fs.layout();
    std::fs::create_dir(layout.txn_dir(txn_id))?;

    // Stage the base root as the initial txn root.
    let mut root = tree::revision_root(fs, base_rev)?;
    if root.id.node_id.number != 0 {
        return Err(FsError::corrupt(format!(
            "root of r{base_rev} is not a root node ('{}')",
            root.id
        )));
    }
    root.predecessor_id = Some(root.id);
    root.predecessor_count += 1;
    root.copyfrom = None;
    root.id = NodeRevId::txn_root(txn_id);
    root.is_fresh_txn_root = true;
    nodes::put_node_revision(fs, &root)?;

    io::create_empty(&layout.txn_proto_rev(txn_id))?;
    io::create_empty(&layout.txn_proto_rev_lock(txn_id))?;
    io::create_empty(&layout.txn_changes(txn_id))?;
    std::fs::write(layout.txn_next_ids(txn_id), "0 0\n")?;

    // The client-date marker starts cleared; changing svn:date later flips
    // it so revprop finalization preserves the client's timestamp.
    let mut props = PropList::new();
    props.insert(PROP_TXN_CLIENT_DATE.to_owned(), b"0".to_vec());
    io::write_atomic(&layout.txn_props(txn_id), &serialize_props(&props)?)?;

    debug!(txn = %txn_id, base = %base_rev, "began transaction");
    Ok(Transaction { txn_id, base_rev })
}

/// Read the base-36 `txn-current` counter and write back the incremented
/// value. Caller holds the txn-counter lock.
fn get_and_increment_txn_key(fs: &FileSystem) -> Result<TxnId> {
    let path = fs.layout().txn_current_file();
    let text = io::read_to_string(&path)?;
    let value = text
        .strip_suffix('\n')
        .and_then(base36_decode)
        .ok_or_else(|| FsError::corrupt("txn-current file corrupt"))?;
    io::write_atomic(&path, format!("{}\n", base36_encode(value + 1)).as_bytes())?;
    Ok(TxnId(value))
}

/// Open an existing transaction by name.
pub fn open_txn(fs: &FileSystem, name: &str) -> Result<Transaction> {
    let txn_id = TxnId::from_name(name).map_err(|_| FsError::NoSuchTransaction {
        name: name.to_owned(),
    })?;
    if !fs.layout().txn_dir(txn_id).is_dir() {
        return Err(FsError::NoSuchTransaction {
            name: name.to_owned(),
        });
    }
    let root = tree::txn_root(fs, txn_id)?;
    let base_rev = root
        .predecessor_id
        .and_then(|id| id.revision())
        .ok_or_else(|| FsError::corrupt(format!("transaction '{name}' has no base revision")))?;
    Ok(Transaction { txn_id, base_rev })
}

/// Abort a transaction: its directory and registry entry disappear.
pub fn abort_txn(fs: &FileSystem, txn_id: TxnId) -> Result<()> {
    purge_txn(fs, txn_id)
}

/// Remove a transaction's on-disk and in-process state. Also used after a
/// successful commit and for garbage-collecting stale transactions.
pub fn purge_txn(fs: &FileSystem, txn_id: TxnId) -> Result<()> {
    fs.shared().with_txn_list(|registry| registry.free(txn_id));
    fs.dir_cache_purge_txn(txn_id);
    match std::fs::remove_dir_all(fs.layout().txn_dir(txn_id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Enumerate transactions with a directory on disk, in no particular
/// order.
pub fn list_transactions(fs: &FileSystem) -> Result<Vec<TxnId>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(fs.layout().txns_dir())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(TXN_DIR_SUFFIX) else {
            continue;
        };
        if let Ok(txn_id) = TxnId::from_name(stem) {
            names.push(txn_id);
        }
    }
    Ok(names)
}

// --- id allocation ---

fn read_next_ids(fs: &FileSystem, txn_id: TxnId) -> Result<(u64, u64)> {
    let text = io::read_to_string(&fs.layout().txn_next_ids(txn_id))?;
    let corrupt = || FsError::corrupt("next-ids file corrupt");
    let (node, rest) = text.split_once(' ').ok_or_else(corrupt)?;
    let copy = rest.strip_suffix('\n').ok_or_else(corrupt)?;
    Ok((
        base36_decode(node).ok_or_else(corrupt)?,
        base36_decode(copy).ok_or_else(corrupt)?,
    ))
}

fn write_next_ids(fs: &FileSystem, txn_id: TxnId, node_id: u64, copy_id: u64) -> Result<()> {
    std::fs::write(
        fs.layout().txn_next_ids(txn_id),
        format!("{} {}\n", base36_encode(node_id), base36_encode(copy_id)),
    )?;
    Ok(())
}

/// Reserve a node-id unique within this transaction. Monotonic, not
/// necessarily contiguous.
pub fn reserve_node_id(fs: &FileSystem, txn_id: TxnId) -> Result<IdPart> {
    let (node_id, copy_id) = read_next_ids(fs, txn_id)?;
    write_next_ids(fs, txn_id, node_id + 1, copy_id)?;
    Ok(IdPart::new(ChangeSet::Transaction(txn_id), node_id))
}

/// Reserve a copy-id unique within this transaction.
pub fn reserve_copy_id(fs: &FileSystem, txn_id: TxnId) -> Result<IdPart> {
    let (node_id, copy_id) = read_next_ids(fs, txn_id)?;
    write_next_ids(fs, txn_id, node_id, copy_id + 1)?;
    Ok(IdPart::new(ChangeSet::Transaction(txn_id), copy_id))
}

/// Allocate the next item index within this transaction's change set.
pub fn allocate_item_index(fs: &FileSystem, txn_id: TxnId) -> Result<u64> {
    let path = fs.layout().txn_item_index(txn_id);
    let current = match std::fs::read_to_string(&path) {
        Ok(text) => text
            .parse::<u64>()
            .map_err(|_| FsError::corrupt("item-index file corrupt"))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ITEM_INDEX_FIRST_USER,
        Err(err) => return Err(err.into()),
    };
    std::fs::write(&path, (current + 1).to_string())?;
    Ok(current)
}

// --- transaction properties ---

/// Read the transaction's property list (the staging copy).
pub fn txn_proplist(fs: &FileSystem, txn_id: TxnId) -> Result<PropList> {
    let file = std::fs::File::open(fs.layout().txn_props(txn_id))?;
    read_hash(&mut BufReader::new(file))
}

/// Apply property changes (`None` removes) and rewrite the property file.
///
/// Setting `svn:date` while the client-date marker is present records that
/// the client supplied its own timestamp; revprop finalization will then
/// keep it instead of stamping commit time.
pub fn change_txn_props(
    fs: &FileSystem,
    txn_id: TxnId,
    changes: &[(String, Option<Vec<u8>>)],
    final_copy: bool,
) -> Result<()> {
    let mut props = match std::fs::File::open(fs.layout().txn_props(txn_id)) {
        Ok(file) => read_hash(&mut BufReader::new(file))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => PropList::new(),
        Err(err) => return Err(err.into()),
    };

    for (name, value) in changes {
        if name == PROP_REVISION_DATE && props.contains_key(PROP_TXN_CLIENT_DATE) {
            props.insert(PROP_TXN_CLIENT_DATE.to_owned(), b"1".to_vec());
        }
        match value {
            Some(value) => {
                props.insert(name.clone(), value.clone());
            }
            None => {
                props.remove(name);
            }
        }
    }

    let target = if final_copy {
        fs.layout().txn_props_final(txn_id)
    } else {
        fs.layout().txn_props(txn_id)
    };
    io::write_atomic(&target, &serialize_props(&props)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use tempfile::TempDir;

    fn fresh_fs() -> (TempDir, FileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = FileSystem::create(dir.path(), FsConfig::default()).unwrap();
        (dir, fs)
    }

    #[test]
    fn begin_creates_expected_files() {
        let (_dir, fs) = fresh_fs();
        let txn = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        let layout = fs.layout();
        assert!(layout.txn_proto_rev(txn.txn_id).is_file());
        assert!(layout.txn_proto_rev_lock(txn.txn_id).is_file());
        assert!(layout.txn_changes(txn.txn_id).is_file());
        assert_eq!(
            std::fs::read_to_string(layout.txn_next_ids(txn.txn_id)).unwrap(),
            "0 0\n"
        );

        let root = tree::txn_root(&fs, txn.txn_id).unwrap();
        assert!(root.is_fresh_txn_root);
        assert_eq!(root.predecessor_count, 1);
        assert_eq!(
            root.predecessor_id.unwrap().revision(),
            Some(RevisionNumber::ZERO)
        );
    }

    #[test]
    fn txn_ids_are_monotonic() {
        let (_dir, fs) = fresh_fs();
        let t0 = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        let t1 = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        assert_eq!(t0.txn_id, TxnId(0));
        assert_eq!(t1.txn_id, TxnId(1));
        assert_eq!(
            std::fs::read_to_string(fs.layout().txn_current_file()).unwrap(),
            "2\n"
        );
    }

    #[test]
    fn counter_without_newline_is_corrupt() {
        let (_dir, fs) = fresh_fs();
        std::fs::write(fs.layout().txn_current_file(), "5").unwrap();
        assert!(matches!(
            begin_txn(&fs, RevisionNumber::ZERO),
            Err(FsError::Corrupt { .. })
        ));
    }

    #[test]
    fn open_and_list_and_purge() {
        let (_dir, fs) = fresh_fs();
        let txn = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        let opened = open_txn(&fs, &txn.txn_id.name()).unwrap();
        assert_eq!(opened, txn);
        assert_eq!(list_transactions(&fs).unwrap(), vec![txn.txn_id]);

        purge_txn(&fs, txn.txn_id).unwrap();
        assert!(list_transactions(&fs).unwrap().is_empty());
        assert!(matches!(
            open_txn(&fs, &txn.txn_id.name()),
            Err(FsError::NoSuchTransaction { .. })
        ));
    }

    #[test]
    fn open_unknown_txn_fails() {
        let (_dir, fs) = fresh_fs();
        assert!(matches!(
            open_txn(&fs, "zz"),
            Err(FsError::NoSuchTransaction { .. })
        ));
        assert!(matches!(
            open_txn(&fs, "not base36!"),
            Err(FsError::NoSuchTransaction { .. })
        ));
    }

    #[test]
    fn id_reservation_is_monotonic() {
        let (_dir, fs) = fresh_fs();
        let txn = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        let n0 = reserve_node_id(&fs, txn.txn_id).unwrap();
        let n1 = reserve_node_id(&fs, txn.txn_id).unwrap();
        let c0 = reserve_copy_id(&fs, txn.txn_id).unwrap();
        assert_eq!(n0.number, 0);
        assert_eq!(n1.number, 1);
        assert_eq!(c0.number, 0);

        let i0 = allocate_item_index(&fs, txn.txn_id).unwrap();
        let i1 = allocate_item_index(&fs, txn.txn_id).unwrap();
        assert_eq!(i0, ITEM_INDEX_FIRST_USER);
        assert_eq!(i1, ITEM_INDEX_FIRST_USER + 1);
    }

    #[test]
    fn malformed_next_ids_is_corrupt() {
        let (_dir, fs) = fresh_fs();
        let txn = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        std::fs::write(fs.layout().txn_next_ids(txn.txn_id), "0 0").unwrap();
        assert!(matches!(
            reserve_node_id(&fs, txn.txn_id),
            Err(FsError::Corrupt { .. })
        ));
        std::fs::write(fs.layout().txn_next_ids(txn.txn_id), "00\n").unwrap();
        assert!(matches!(
            reserve_node_id(&fs, txn.txn_id),
            Err(FsError::Corrupt { .. })
        ));
    }

    #[test]
    fn client_date_marker_flips_on_svn_date() {
        let (_dir, fs) = fresh_fs();
        let txn = begin_txn(&fs, RevisionNumber::ZERO).unwrap();
        assert_eq!(txn_proplist(&fs, txn.txn_id).unwrap()[PROP_TXN_CLIENT_DATE], b"0");

        change_txn_props(
            &fs,
            txn.txn_id,
            &[(
                PROP_REVISION_DATE.to_owned(),
                Some(b"2001-01-01T00:00:00.000000Z".to_vec()),
            )],
            false,
        )
        .unwrap();
        assert_eq!(txn_proplist(&fs, txn.txn_id).unwrap()[PROP_TXN_CLIENT_DATE], b"1");
    }
}
