//! The commit pipeline: promote a transaction into the next revision.
//!
//! Runs entirely under the global write lock. The tree rewrite walks the
//! staged transaction tree depth-first, writing every mutable directory,
//! property list and node-rev into the proto-rev file with
//! revision-tagged ids; the changed-paths block follows; the proto indexes
//! are folded into their final files; and an atomic rename sequence
//! publishes the new revision, with the `current` bump as the last
//! observable mutation.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Seek, Write};

use md5::Digest as _;
use tracing::{debug, info, info_span};

use fsvn_delta::DeltaEncoder;
use fsvn_error::{FsError, Result};
use fsvn_types::encoding::write_hash;
use fsvn_types::id::ITEM_INDEX_CHANGES;
use fsvn_types::{
    fspath, ChangeKind, ChangeSet, Md5, NodeKind, NodeRevId, NodeRevision, PathChange, RepId,
    Representation, RevisionNumber, Sha1, TxnId,
};

use crate::config::FsConfig;
use crate::fold;
use crate::fs::FileSystem;
use crate::index::{self, ItemType, P2lEntry};
use crate::io;
use crate::nodes;
use crate::rep_cache::{self, RepsHash};
use crate::rep_read::{RepBase, RepHeader, ENDREP};
use crate::revprops::{
    self, PROP_REVISION_DATE, PROP_TXN_CHECK_LOCKS, PROP_TXN_CHECK_OOD, PROP_TXN_CLIENT_DATE,
};
use crate::tree;
use crate::txn::{self, Transaction};
use crate::{delta_base, rep_read};

/// Commit `txn`, returning the new revision number.
///
/// On success the transaction is gone and `youngest` has advanced by one.
/// On `TxnOutOfDate` the transaction is left intact for the caller to
/// retry against a newer base.
pub fn commit(fs: &FileSystem, txn: &Transaction) -> Result<RevisionNumber> {
    let span = info_span!("commit", txn = %txn.txn_id, base = %txn.base_rev);
    let _guard = span.enter();

    let sharing = fs.config().rep_sharing_allowed;
    let mut reps_to_cache: Vec<Representation> = Vec::new();
    let mut reps_hash: RepsHash = RepsHash::new();

    let new_rev =
        fs.with_write_lock(|| commit_body(fs, txn, &mut reps_to_cache, &mut reps_hash))?;

    // The commit is complete and visible; rep-cache rows are added outside
    // the write lock, in one batch.
    if sharing {
        rep_cache::set_batch(fs, &reps_to_cache)?;
    }

    info!(rev = %new_rev, "committed");
    Ok(new_rev)
}

fn commit_body(
    fs: &FileSystem,
    txn: &Transaction,
    reps_to_cache: &mut Vec<Representation>,
    reps_hash: &mut RepsHash,
) -> Result<RevisionNumber> {
    let txn_id = txn.txn_id;
    let old_rev = fs.youngest()?;
    if txn.base_rev != old_rev {
        return Err(FsError::TxnOutOfDate {
            base_rev: txn.base_rev.get(),
            youngest: old_rev.get(),
        });
    }

    // Locks may have been added or stolen since the transaction staged its
    // changes; re-verify every changed path now that we are serialized.
    let changed_paths = fold::txn_changes_fetch(fs, txn_id)?;
    verify_locks(fs, &changed_paths)?;
    verify_moves(fs, txn, old_rev, &changed_paths)?;

    let new_rev = old_rev.next();
    debug!(rev = %new_rev, changes = changed_paths.len(), "writing final revision");

    let (mut proto_file, proto_lock) = fs.writable_proto_rev(txn_id)?;

    let root_id = NodeRevId::txn_root(txn_id);
    write_final_rev(
        fs,
        &mut proto_file,
        new_rev,
        &root_id,
        txn_id,
        reps_to_cache,
        reps_hash,
        true,
    )?;

    let mut changed_paths = changed_paths;
    write_final_changed_path_info(fs, &mut proto_file, txn_id, &mut changed_paths, new_rev)?;

    proto_file.sync_all()?;
    drop(proto_file);
    // Keep the proto-rev lock: the file still carries the txn name until
    // the rename below, and another writer must not append meanwhile.

    if fs.layout().starts_shard(new_rev) {
        io::make_dir_copy_perms(&fs.layout().rev_shard_dir(new_rev), &fs.layout().revs_dir())?;
        io::make_dir_copy_perms(
            &fs.layout().revprops_shard_dir(new_rev),
            &fs.layout().revprops_dir(),
        )?;
    }

    // Fold the proto indexes into their final form at the revision paths.
    index::write_final_l2p(
        &fs.layout().l2p_file(new_rev),
        index::read_l2p_proto(&fs.layout().txn_l2p_proto_index(txn_id))?,
    )?;
    index::write_final_p2l(
        &fs.layout().p2l_file(new_rev),
        index::read_p2l_proto(&fs.layout().txn_p2l_proto_index(txn_id))?,
    )?;

    // Atomic publish: the proto-rev file becomes the revision file, with
    // the previous revision file as its permission reference.
    io::move_into_place(
        &fs.layout().txn_proto_rev(txn_id),
        &fs.layout().rev_file(new_rev),
    )?;
    io::copy_perms(&fs.layout().rev_file(old_rev), &fs.layout().rev_file(new_rev))?;

    // Further writes through the txn name would fail (the file is gone),
    // so the proto-rev lock can go; purging the txn dir needs it gone.
    proto_lock.unlock()?;

    let final_revprops = write_final_revprop(fs, txn)?;
    io::move_into_place(&final_revprops, &fs.layout().revprops_file(new_rev))?;

    if fs.config().verify_before_commit {
        verify_as_new_revision(fs, new_rev)?;
    }

    // The last observable mutation: bump `current`.
    fs.write_current(new_rev)?;

    txn::purge_txn(fs, txn_id)?;
    Ok(new_rev)
}

// --- lock verification ---

/// Verify path locks for every changed path, depth-first, skipping
/// children of paths already verified recursively. Modifications get a
/// non-recursive check; everything else (adds, deletes, replaces) gets a
/// recursive one.
fn verify_locks(fs: &FileSystem, changed_paths: &BTreeMap<String, PathChange>) -> Result<()> {
    let Some(verifier) = fs.lock_verifier() else {
        return Ok(());
    };

    let mut paths: Vec<&str> = changed_paths.keys().map(String::as_str).collect();
    paths.sort_by(|a, b| fspath::compare(a, b));

    let mut last_recursed: Option<&str> = None;
    for path in paths {
        if let Some(ancestor) = last_recursed {
            if fspath::is_child(ancestor, path) {
                continue;
            }
        }
        let recurse = changed_paths[path].kind != ChangeKind::Modify;
        verifier(path, recurse)?;
        if recurse {
            last_recursed = Some(path);
        }
    }
    Ok(())
}

// --- move verification ---

/// Every ancestor of `path`, starting at the path itself and ending at the
/// root.
fn self_and_ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(path);
    std::iter::from_fn(move || {
        let yielded = current?;
        current = fspath::split(yielded).map(|(parent, _)| parent);
        Some(yielded)
    })
}

fn check_for_duplicate_move_source(
    source_paths: &mut HashSet<String>,
    change: &PathChange,
) -> Result<()> {
    if !matches!(change.kind, ChangeKind::Move | ChangeKind::MoveReplace) {
        return Ok(());
    }
    let Some((_, source)) = &change.copyfrom else {
        return Ok(());
    };
    if !source_paths.insert(source.clone()) {
        return Err(FsError::AmbiguousMove {
            path: source.clone(),
        });
    }
    Ok(())
}

/// Verify that the moves in this commit are unique and that each move's
/// source subtree has been deleted.
fn verify_moves(
    fs: &FileSystem,
    txn: &Transaction,
    old_rev: RevisionNumber,
    changed_paths: &BTreeMap<String, PathChange>,
) -> Result<()> {
    let moves: BTreeMap<&str, &PathChange> = changed_paths
        .iter()
        .filter(|(_, change)| {
            change.copyfrom.is_some()
                && matches!(change.kind, ChangeKind::Move | ChangeKind::MoveReplace)
        })
        .map(|(path, change)| (path.as_str(), change))
        .collect();
    if moves.is_empty() {
        return Ok(());
    }

    let mut deletions: Vec<String> = changed_paths
        .iter()
        .filter(|(_, change)| change.kind.is_deletion())
        .map(|(path, _)| path.clone())
        .collect();

    // A deletion inside a moved-away subtree refers, in the base revision,
    // to the corresponding path under the move source; rewrite it so the
    // source-deletion check below sees base-revision paths throughout.
    for deleted in &mut deletions {
        let Some((move_path, move_change)) = self_and_ancestors(deleted)
            .find_map(|candidate| moves.get_key_value(candidate))
        else {
            continue;
        };
        let source = &move_change.copyfrom.as_ref().expect("filtered above").1;
        let rel = fspath::skip_ancestor(move_path, deleted)
            .expect("ancestor by construction")
            .to_owned();
        *deleted = if rel.is_empty() {
            (*source).clone()
        } else {
            fspath::join(source, &rel)
        };
    }

    // The same source path must never occur in more than one move since
    // our base revision: neither twice within this txn, nor in any
    // revision committed after the base.
    let mut source_paths = HashSet::new();
    for change in moves.values() {
        check_for_duplicate_move_source(&mut source_paths, change)?;
    }
    let mut rev = txn.base_rev.next();
    while rev <= old_rev {
        for change in fold::paths_changed(fs, rev)?.values() {
            check_for_duplicate_move_source(&mut source_paths, change)?;
        }
        rev = rev.next();
    }

    // Each move source (or one of its ancestors) must have been deleted in
    // this txn.
    let deletion_set: HashSet<&str> = deletions.iter().map(String::as_str).collect();
    for change in moves.values() {
        let source = &change.copyfrom.as_ref().expect("filtered above").1;
        if !self_and_ancestors(source).any(|candidate| deletion_set.contains(candidate)) {
            return Err(FsError::IncompleteMove {
                path: source.clone(),
            });
        }
    }
    Ok(())
}

// --- tree rewrite ---

/// Write a deltified representation of serialized hash `content` (a
/// directory listing or property list) into the proto-rev file, with rep
/// sharing. Returns the final revision-tagged representation.
#[allow(clippy::too_many_arguments)]
fn write_hash_delta_rep(
    fs: &FileSystem,
    file: &mut File,
    txn_id: TxnId,
    noderev: &NodeRevision,
    content: &[u8],
    item_type: ItemType,
    reps_hash: Option<&RepsHash>,
    rev: RevisionNumber,
) -> Result<Representation> {
    let is_props = matches!(item_type, ItemType::FileProps | ItemType::DirProps);
    let base = delta_base::choose_delta_base(fs, noderev, is_props)?;
    let source = rep_read::optional_rep_contents(fs, base.as_ref())?;

    let offset = file.stream_position()?;
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
    file.write_all(header.unparse().as_bytes())?;
    let delta_start = file.stream_position()?;

    let mut encoder = DeltaEncoder::new(&mut *file, source)?;
    encoder.write(content)?;
    encoder.finish()?;
    let rep_end = file.stream_position()?;

    let mut rep = Representation {
        id: RepId {
            change_set: ChangeSet::Revision(rev),
            number: 0,
        },
        size: rep_end - delta_start,
        expanded_size: content.len() as u64,
        md5: Md5(md5::Md5::digest(content).into()),
        sha1: Some(Sha1(sha1::Sha1::digest(content).into())),
    };

    if let Some(old) = rep_cache::get_shared_rep(fs, txn_id, &rep, reps_hash)? {
        // Erase what we just wrote and reference the old rep.
        file.set_len(offset)?;
        file.seek(std::io::SeekFrom::Start(offset))?;
        return Ok(old);
    }

    file.write_all(ENDREP)?;
    let item = txn::allocate_item_index(fs, txn_id)?;
    rep.id.number = item;
    index::store_l2p_proto_entry(fs, txn_id, offset, item)?;
    let end = file.stream_position()?;
    index::store_p2l_proto_entry(
        fs,
        txn_id,
        &P2lEntry {
            offset,
            size: end - offset,
            item_type,
            item,
        },
    )?;
    Ok(rep)
}

/// Sanity-check the root node-rev of the revision about to be committed:
/// its predecessor count must exceed the current head root's by exactly
/// the revision distance.
fn validate_root_noderev(
    fs: &FileSystem,
    root_noderev: &NodeRevision,
    rev: RevisionNumber,
) -> Result<()> {
    let head_rev = RevisionNumber(rev.get() - 1);
    let head_root = tree::revision_root(fs, head_rev)?;
    let distance = rev.get() - head_rev.get();
    if root_noderev.predecessor_count.wrapping_sub(head_root.predecessor_count) != distance {
        return Err(FsError::corrupt(format!(
            "predecessor count for the root node-revision is wrong: found ({}+{} != {}), \
             committing r{rev}",
            head_root.predecessor_count, distance, root_noderev.predecessor_count
        )));
    }
    Ok(())
}

/// Copy the node-rev `id` from the transaction into the proto-rev file,
/// depth-first (children before their directory), rewriting every
/// txn-tagged id to `rev`. Returns the node's final id, or `None` if the
/// node was not part of the transaction.
#[allow(clippy::too_many_arguments)]
fn write_final_rev(
    fs: &FileSystem,
    file: &mut File,
    rev: RevisionNumber,
    id: &NodeRevId,
    txn_id: TxnId,
    reps_to_cache: &mut Vec<Representation>,
    reps_hash: &mut RepsHash,
    at_root: bool,
) -> Result<Option<NodeRevId>> {
    if !id.is_txn() {
        return Ok(None);
    }
    let mut noderev = nodes::get_node_revision(fs, id)?;

    if noderev.kind == NodeKind::Dir {
        // Write out all the children first.
        let mut entries = tree::dir_entries(fs, &noderev)?;
        for (_, entry) in entries.iter_mut() {
            if let Some(new_id) = write_final_rev(
                fs,
                file,
                rev,
                &entry.id,
                txn_id,
                reps_to_cache,
                reps_hash,
                false,
            )? {
                entry.id = new_id;
            }
        }

        if noderev
            .data_rep
            .as_ref()
            .is_some_and(Representation::is_mutable)
        {
            // The listing itself, lexicographically sorted so the final
            // file is deterministic and repeatable.
            let serialized: BTreeMap<String, Vec<u8>> = entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.unparse().into_bytes()))
                .collect();
            let mut content = Vec::new();
            write_hash(&mut content, &serialized)?;
            noderev.data_rep = Some(write_hash_delta_rep(
                fs,
                file,
                txn_id,
                &noderev,
                &content,
                ItemType::DirRep,
                None,
                rev,
            )?);
        }
    } else if let Some(rep) = &mut noderev.data_rep {
        // File contents were already written by the rep writer; the rep
        // just moves from the txn change set to the new revision.
        if rep.is_mutable() {
            rep.id.change_set = ChangeSet::Revision(rev);
        }
    }

    if noderev
        .prop_rep
        .as_ref()
        .is_some_and(Representation::is_mutable)
    {
        let item_type = if noderev.kind == NodeKind::Dir {
            ItemType::DirProps
        } else {
            ItemType::FileProps
        };
        let props = tree::proplist(fs, &noderev)?;
        let content = revprops::serialize_props(&props)?;
        noderev.prop_rep = Some(write_hash_delta_rep(
            fs,
            file,
            txn_id,
            &noderev,
            &content,
            item_type,
            Some(reps_hash),
            rev,
        )?);
    }

    // Convert the temporary id into a permanent revision one.
    noderev.id.finalize(rev);

    let my_offset = file.stream_position()?;
    index::store_l2p_proto_entry(fs, txn_id, my_offset, noderev.id.noderev_id.number)?;

    if fs.config().rep_sharing_allowed {
        // Save freshly written reps for the rep-cache; prop reps also join
        // the per-commit hash so identical prop lists share within this
        // commit.
        if let Some(rep) = &noderev.data_rep {
            if noderev.kind == NodeKind::File
                && rep.id.change_set == ChangeSet::Revision(rev)
            {
                reps_to_cache.push(rep.clone());
            }
        }
        if let Some(rep) = &noderev.prop_rep {
            if rep.id.change_set == ChangeSet::Revision(rev) {
                reps_to_cache.push(rep.clone());
                if let Some(sha1) = &rep.sha1 {
                    reps_hash.insert(sha1.0, rep.clone());
                }
            }
        }
    }

    // SHA-1 is only worth storing for file contents; drop it for
    // directory listings and property lists.
    if noderev.kind == NodeKind::Dir {
        if let Some(rep) = &mut noderev.data_rep {
            rep.sha1 = None;
        }
    }
    if let Some(rep) = &mut noderev.prop_rep {
        rep.sha1 = None;
    }

    noderev.is_fresh_txn_root = false;

    if at_root {
        validate_root_noderev(fs, &noderev, rev)?;
    }

    file.write_all(noderev.unparse().as_bytes())?;
    let end = file.stream_position()?;
    index::store_p2l_proto_entry(
        fs,
        txn_id,
        &P2lEntry {
            offset: my_offset,
            size: end - my_offset,
            item_type: ItemType::NodeRev,
            item: noderev.id.noderev_id.number,
        },
    )?;

    Ok(Some(noderev.id))
}

/// Write the folded changed-paths block as one record and index it.
fn write_final_changed_path_info(
    fs: &FileSystem,
    file: &mut File,
    txn_id: TxnId,
    changed_paths: &mut BTreeMap<String, PathChange>,
    new_rev: RevisionNumber,
) -> Result<()> {
    // All moves specify the copy-from revision as the commit's parent.
    for change in changed_paths.values_mut() {
        if change.kind == ChangeKind::Move {
            if let Some((rev, _)) = &mut change.copyfrom {
                *rev = RevisionNumber(new_rev.get() - 1);
            }
        }
    }

    let serialized: BTreeMap<String, Vec<u8>> = changed_paths
        .iter()
        .map(|(path, change)| (path.clone(), change.unparse().into_bytes()))
        .collect();
    let offset = file.stream_position()?;
    let mut content = Vec::new();
    write_hash(&mut content, &serialized)?;
    file.write_all(&content)?;
    let end = file.stream_position()?;

    index::store_p2l_proto_entry(
        fs,
        txn_id,
        &P2lEntry {
            offset,
            size: end - offset,
            item_type: ItemType::Changes,
            item: ITEM_INDEX_CHANGES,
        },
    )?;
    index::store_l2p_proto_entry(fs, txn_id, offset, ITEM_INDEX_CHANGES)
}

// --- revprop finalization ---

/// Produce the file containing the final revision properties: the internal
/// marker properties stripped, and `svn:date` stamped with commit time
/// unless the client supplied its own.
fn write_final_revprop(fs: &FileSystem, txn: &Transaction) -> Result<std::path::PathBuf> {
    let props = txn::txn_proplist(fs, txn.txn_id)?;
    let mut mods: Vec<(String, Option<Vec<u8>>)> = Vec::new();

    for marker in [PROP_TXN_CHECK_OOD, PROP_TXN_CHECK_LOCKS, PROP_TXN_CLIENT_DATE] {
        if props.contains_key(marker) {
            mods.push((marker.to_owned(), None));
        }
    }

    let client_date = props.get(PROP_TXN_CLIENT_DATE);
    if client_date.map(Vec::as_slice) != Some(b"1") {
        mods.push((
            PROP_REVISION_DATE.to_owned(),
            Some(revprops::format_date_now().into_bytes()),
        ));
    }

    if mods.is_empty() {
        Ok(fs.layout().txn_props(txn.txn_id))
    } else {
        txn::change_txn_props(fs, txn.txn_id, &mods, true)?;
        Ok(fs.layout().txn_props_final(txn.txn_id))
    }
}

// --- post-write verification ---

/// Re-open the filesystem with a fresh handle (own caches, no rep
/// sharing) and read the whole new revision back, just before `current`
/// is bumped.
fn verify_as_new_revision(fs: &FileSystem, new_rev: RevisionNumber) -> Result<()> {
    let fresh = FileSystem::open(
        fs.layout().root(),
        FsConfig {
            rep_sharing_allowed: false,
            ..fs.config().clone()
        },
    )?;
    let root = tree::revision_root(&fresh, new_rev)?;
    verify_subtree(&fresh, &root)
}

fn verify_subtree(fs: &FileSystem, noderev: &NodeRevision) -> Result<()> {
    tree::proplist(fs, noderev)?;
    match noderev.kind {
        NodeKind::File => {
            tree::file_contents(fs, noderev)?;
        }
        NodeKind::Dir => {
            for entry in tree::dir_entries(fs, noderev)?.values() {
                let child = nodes::get_node_revision(fs, &entry.id)?;
                verify_subtree(fs, &child)?;
            }
        }
    }
    Ok(())
}
