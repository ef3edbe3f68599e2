//! Process-wide shared state: the active-transaction registry and the
//! in-process halves of the repository locks.
//!
//! POSIX advisory locks never conflict with the owning process, so two
//! handles to the same repository opened in one process must coordinate
//! through shared mutexes. A process-global table maps the canonical
//! repository root to its [`FsShared`], the same way the Unix VFS keeps one
//! canonical descriptor per inode; handles hold an `Arc` and pass it
//! explicitly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use fsvn_error::{FsError, Result};
use fsvn_types::TxnId;

/// One active transaction's shared bookkeeping.
#[derive(Debug)]
pub struct SharedTxn {
    pub txn_id: TxnId,
    /// True while some thread holds the proto-rev lock for this txn.
    pub being_written: bool,
}

/// Registry of active transactions. All access goes through
/// [`FsShared::with_txn_list`].
#[derive(Debug, Default)]
pub struct TxnRegistry {
    /// Newest first; typical workloads have a single active transaction.
    entries: Vec<SharedTxn>,
}

impl TxnRegistry {
    /// Look up `txn_id`, allocating an entry if absent.
    pub fn get_or_create(&mut self, txn_id: TxnId) -> &mut SharedTxn {
        if let Some(idx) = self.entries.iter().position(|t| t.txn_id == txn_id) {
            return &mut self.entries[idx];
        }
        self.entries.insert(
            0,
            SharedTxn {
                txn_id,
                being_written: false,
            },
        );
        &mut self.entries[0]
    }

    /// Look up `txn_id` without allocating.
    pub fn lookup(&mut self, txn_id: TxnId) -> Option<&mut SharedTxn> {
        self.entries.iter_mut().find(|t| t.txn_id == txn_id)
    }

    /// Unlink the entry for `txn_id`, if present.
    pub fn free(&mut self, txn_id: TxnId) {
        self.entries.retain(|t| t.txn_id != txn_id);
    }
}

/// Per-repository shared state, one instance per process.
#[derive(Debug, Default)]
pub struct FsShared {
    /// In-process half of the global write lock.
    pub write_mutex: Mutex<()>,
    /// In-process half of the txn-counter lock.
    pub txn_current_mutex: Mutex<()>,
    /// In-process half of the rep-cache append lock. The rep-cache is
    /// written after the write lock is released, so it needs its own
    /// exclusion.
    pub rep_cache_mutex: Mutex<()>,
    txn_list: Mutex<TxnRegistry>,
}

impl FsShared {
    /// Run `body` with the transaction-list lock held.
    pub fn with_txn_list<T>(&self, body: impl FnOnce(&mut TxnRegistry) -> T) -> T {
        let mut registry = self.txn_list.lock();
        body(&mut registry)
    }

    /// Mark `txn_id` as no longer being written, verifying it was.
    pub fn clear_being_written(&self, txn_id: TxnId) -> Result<()> {
        self.with_txn_list(|registry| {
            let txn = registry.lookup(txn_id).ok_or_else(|| {
                FsError::corrupt(format!("can't unlock unknown transaction '{txn_id}'"))
            })?;
            if !txn.being_written {
                return Err(FsError::corrupt(format!(
                    "can't unlock nonlocked transaction '{txn_id}'"
                )));
            }
            txn.being_written = false;
            Ok(())
        })
    }
}

/// The per-process table of repository shared state, keyed by canonical
/// root path.
fn shared_table() -> &'static Mutex<HashMap<PathBuf, Weak<FsShared>>> {
    static TABLE: OnceLock<Mutex<HashMap<PathBuf, Weak<FsShared>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Shared state for the repository at `root`, deduplicated per process.
pub fn shared_for(root: &Path) -> Result<Arc<FsShared>> {
    let canonical = root.canonicalize()?;
    let mut table = shared_table().lock();
    if let Some(existing) = table.get(&canonical).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let fresh = Arc::new(FsShared::default());
    table.retain(|_, weak| weak.strong_count() > 0);
    table.insert(canonical, Arc::downgrade(&fresh));
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn registry_single_entry_per_txn() {
        let mut registry = TxnRegistry::default();
        registry.get_or_create(TxnId(1)).being_written = true;
        assert!(registry.get_or_create(TxnId(1)).being_written);
        assert_eq!(registry.entries.len(), 1);
        registry.get_or_create(TxnId(2));
        assert_eq!(registry.entries.len(), 2);
        registry.free(TxnId(1));
        assert!(registry.lookup(TxnId(1)).is_none());
        assert!(registry.lookup(TxnId(2)).is_some());
    }

    #[test]
    fn clear_being_written_requires_locked_entry() {
        let shared = FsShared::default();
        assert!(shared.clear_being_written(TxnId(9)).is_err());
        shared.with_txn_list(|r| r.get_or_create(TxnId(9)).being_written = true);
        shared.clear_being_written(TxnId(9)).unwrap();
        assert!(shared.clear_being_written(TxnId(9)).is_err());
    }

    #[test]
    fn shared_state_deduplicated_per_path() {
        let dir = TempDir::new().unwrap();
        let a = shared_for(dir.path()).unwrap();
        let b = shared_for(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = TempDir::new().unwrap();
        let c = shared_for(other.path()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
