//! Rep sharing: content-addressed deduplication of representations.
//!
//! Two layers answer "have we stored these bytes before": an in-memory
//! per-commit map of reps written in the current commit, and the persistent
//! `rep-cache` file keyed by SHA-1. A transaction additionally leaves one
//! sidecar file per written rep, named by its SHA-1 digest, for intra-txn
//! hits.
//!
//! Persistent-lookup failures are downgraded to warnings and treated as
//! misses, except corruption and malfunctions, which would let bad index
//! rows propagate into new revisions and are therefore fatal.

use std::collections::HashMap;
use std::io::Write;

use fsvn_error::{FsError, Result};
use fsvn_types::{Representation, Sha1, TxnId};

use crate::fs::FileSystem;
use crate::io;
use crate::lock::FileLock;

/// Per-commit map of freshly written reps, keyed by SHA-1 digest bytes.
pub type RepsHash = HashMap<[u8; 20], Representation>;

/// Look `sha1` up in the persistent rep-cache file.
pub fn lookup(fs: &FileSystem, sha1: &Sha1) -> Result<Option<Representation>> {
    let path = fs.layout().rep_cache_file();
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let wanted = sha1.hex();
    for line in text.lines() {
        let (digest, rep) = line
            .split_once(' ')
            .ok_or_else(|| FsError::corrupt(format!("malformed rep-cache row '{line}'")))?;
        if digest == wanted {
            return Representation::parse(rep).map(Some);
        }
    }
    Ok(None)
}

/// Append `reps` to the persistent rep-cache in one locked batch,
/// skipping digests that are already present.
pub fn set_batch(fs: &FileSystem, reps: &[Representation]) -> Result<()> {
    if reps.is_empty() {
        return Ok(());
    }
    let path = fs.layout().rep_cache_file();
    // Advisory locks never conflict with our own process; the in-process
    // mutex covers sibling handles.
    let _process = fs.shared().rep_cache_mutex.lock();
    let lock = FileLock::acquire_blocking(&path)?;

    let existing: std::collections::HashSet<String> = match std::fs::read_to_string(&path) {
        Ok(text) => text
            .lines()
            .filter_map(|line| line.split_once(' ').map(|(d, _)| d.to_owned()))
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Default::default(),
        Err(err) => return Err(err.into()),
    };

    let mut batch = String::new();
    for rep in reps {
        let Some(sha1) = &rep.sha1 else { continue };
        let digest = sha1.hex();
        if existing.contains(&digest) {
            continue;
        }
        use std::fmt::Write as _;
        let _ = writeln!(batch, "{digest} {rep}");
    }

    let mut file = io::open_append(&path)?;
    file.write_all(batch.as_bytes())?;
    file.sync_all()?;
    lock.unlock()
}

/// Validate that a cached representation still exists on disk.
fn check_rep(fs: &FileSystem, rep: &Representation) -> Result<()> {
    let Some(rev) = rep.id.change_set.revision() else {
        return Err(FsError::corrupt(format!(
            "rep-cache row refers to uncommitted representation '{rep}'"
        )));
    };
    crate::index::l2p_lookup(fs, rev, rep.id.number).map(|_| ())
}

/// Find an existing representation with the same content as `rep`.
///
/// Consults, in order: the per-commit `reps_hash`, the persistent
/// rep-cache (with the downgrade-to-warning policy), and the transaction's
/// on-disk SHA-1 sidecars. A hit returns a fresh descriptor carrying the
/// new rep's MD5; cached state is never mutated.
pub fn get_shared_rep(
    fs: &FileSystem,
    txn_id: TxnId,
    rep: &Representation,
    reps_hash: Option<&RepsHash>,
) -> Result<Option<Representation>> {
    if !fs.config().rep_sharing_allowed {
        return Ok(None);
    }
    let Some(sha1) = &rep.sha1 else {
        return Ok(None);
    };

    let mut old = reps_hash.and_then(|hash| hash.get(&sha1.0).cloned());

    if old.is_none() {
        match lookup(fs, sha1) {
            Ok(Some(candidate)) => {
                // A row pointing past youngest means the rep-cache refers
                // to revisions that do not (or no longer) exist; once more
                // commits make that revision number real, the row would
                // silently alias unrelated content.
                if let Some(rev) = candidate.id.change_set.revision() {
                    if rev > fs.youngest()? {
                        return Err(FsError::corrupt(format!(
                            "rep-cache row for {sha1} is forward-dated to r{rev}"
                        )));
                    }
                }
                check_rep(fs, &candidate)?;
                old = Some(candidate);
            }
            Ok(None) => {}
            Err(err) if err.is_fatal_for_rep_sharing() => return Err(err),
            Err(err) => {
                // Something is wrong with the rep-sharing index; continue
                // without sharing.
                fs.warn(&err);
            }
        }
    }

    if old.is_none() {
        let sidecar = fs.layout().txn_sha1(txn_id, sha1);
        if sidecar.is_file() {
            let text = io::read_to_string(&sidecar)?;
            old = Some(Representation::parse(text.trim_end_matches('\n'))?);
        }
    }

    Ok(old.map(|old| Representation {
        md5: rep.md5,
        ..old
    }))
}

/// Record a freshly written rep in the transaction's SHA-1 sidecar
/// directory for intra-transaction sharing.
pub fn store_sha1_sidecar(fs: &FileSystem, txn_id: TxnId, rep: &Representation) -> Result<()> {
    let Some(sha1) = &rep.sha1 else {
        return Ok(());
    };
    std::fs::write(
        fs.layout().txn_sha1(txn_id, sha1),
        format!("{rep}\n"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::fs::FileSystem;
    use fsvn_types::{ChangeSet, Md5, RepId, RevisionNumber};
    use tempfile::TempDir;

    fn rep(rev: u32, number: u64, seed: u8) -> Representation {
        Representation {
            id: RepId {
                change_set: ChangeSet::Revision(RevisionNumber(rev)),
                number,
            },
            size: 10,
            expanded_size: 20,
            md5: Md5([seed; 16]),
            sha1: Some(Sha1([seed; 20])),
        }
    }

    fn fresh() -> (TempDir, FileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = FileSystem::create(dir.path(), FsConfig::default()).unwrap();
        (dir, fs)
    }

    #[test]
    fn batch_write_then_lookup() {
        let (_dir, fs) = fresh();
        let a = rep(0, 3, 0xaa);
        let b = rep(0, 4, 0xbb);
        set_batch(&fs, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(lookup(&fs, a.sha1.as_ref().unwrap()).unwrap(), Some(a));
        assert_eq!(lookup(&fs, b.sha1.as_ref().unwrap()).unwrap(), Some(b));
        assert_eq!(lookup(&fs, &Sha1([0xcc; 20])).unwrap(), None);
    }

    #[test]
    fn batch_write_skips_existing_digests() {
        let (_dir, fs) = fresh();
        let a = rep(0, 3, 0xaa);
        set_batch(&fs, &[a.clone()]).unwrap();
        set_batch(&fs, &[a.clone()]).unwrap();
        let text = std::fs::read_to_string(fs.layout().rep_cache_file()).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn malformed_row_is_corrupt() {
        let (_dir, fs) = fresh();
        std::fs::write(fs.layout().rep_cache_file(), "not a row\n").unwrap();
        assert!(matches!(
            lookup(&fs, &Sha1([0; 20])),
            Err(FsError::Corrupt { .. })
        ));
    }

    #[test]
    fn forward_dated_row_is_fatal() {
        let (_dir, fs) = fresh();
        // Youngest is 0; a row claiming r7 is forward-dated.
        let bogus = rep(7, 3, 0xdd);
        set_batch(&fs, &[bogus.clone()]).unwrap();
        let probe = rep(7, 9, 0xdd);
        let result = get_shared_rep(&fs, TxnId(0), &probe, None);
        assert!(matches!(result, Err(FsError::Corrupt { .. })));
    }

    #[test]
    fn sharing_disabled_is_always_a_miss() {
        let dir = TempDir::new().unwrap();
        let fs = FileSystem::create(dir.path(), FsConfig::default().rep_sharing(false)).unwrap();
        let a = rep(0, 3, 0xaa);
        set_batch(&fs, &[a.clone()]).unwrap();
        assert_eq!(get_shared_rep(&fs, TxnId(0), &a, None).unwrap(), None);
    }

    #[test]
    fn hit_returns_fresh_descriptor_with_new_md5() {
        let (_dir, fs) = fresh();
        let mut hash = RepsHash::new();
        let stored = rep(0, 3, 0xaa);
        hash.insert(stored.sha1.unwrap().0, stored.clone());

        let mut probe = rep(0, 9, 0xaa);
        probe.md5 = Md5([0x11; 16]);
        let hit = get_shared_rep(&fs, TxnId(0), &probe, Some(&hash))
            .unwrap()
            .expect("hash hit");
        assert_eq!(hit.id, stored.id);
        assert_eq!(hit.md5, probe.md5);
        // The cached entry itself is untouched.
        assert_eq!(hash[&stored.sha1.unwrap().0].md5, stored.md5);
    }
}
