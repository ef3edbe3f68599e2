//! The filesystem handle.
//!
//! A [`FileSystem`] is one session's view of a repository on disk. Handles
//! to the same repository within one process share an [`FsShared`] (the
//! in-process lock halves and the transaction registry); everything else is
//! per-handle.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use fsvn_error::{FsError, Result, Writer};
use fsvn_types::id::ITEM_INDEX_CHANGES;
use fsvn_types::{DirEntry, NodeKind, NodeRevId, NodeRevision, RevisionNumber, TxnId};

use crate::config::FsConfig;
use crate::index::{self, ItemType, L2pEntry, P2lEntry};
use crate::io;
use crate::layout::Layout;
use crate::lock::FileLock;
use crate::registry::{self, FsShared};
use crate::revprops::{self, PROP_REVISION_DATE};

/// Repository format understood by this implementation.
pub const FORMAT_NUMBER: u32 = 1;

/// Called for a path-level lock check: `(path, recurse)`. The commit
/// pipeline invokes it for every changed path while the write lock is held.
pub type LockVerifier = Box<dyn Fn(&str, bool) -> Result<()> + Send + Sync>;

/// Sink for downgraded rep-sharing errors.
pub type WarningSink = Box<dyn Fn(&FsError) + Send + Sync>;

/// One session's handle to a repository.
pub struct FileSystem {
    layout: Layout,
    config: FsConfig,
    shared: Arc<FsShared>,
    youngest_cache: Mutex<Option<RevisionNumber>>,
    min_unpacked_cache: Mutex<Option<RevisionNumber>>,
    has_write_lock: AtomicBool,
    dir_cache: Mutex<HashMap<NodeRevId, BTreeMap<String, DirEntry>>>,
    lock_verifier: Option<LockVerifier>,
    warning: WarningSink,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("root", &self.layout.root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// Create a new repository at `path` and open a handle to it.
    ///
    /// The new repository contains revision 0: an empty tree with readable
    /// revision, index and revprop files.
    pub fn create(path: &Path, config: FsConfig) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let layout = Layout::new(path.to_path_buf(), config.max_files_per_dir);

        let format = format!(
            "{FORMAT_NUMBER}\nlayout sharded {}\naddressing logical\n",
            config.max_files_per_dir
        );
        io::write_atomic(&layout.format_file(), format.as_bytes())?;

        std::fs::create_dir_all(layout.rev_shard_dir(RevisionNumber::ZERO))?;
        std::fs::create_dir_all(layout.revprops_shard_dir(RevisionNumber::ZERO))?;
        std::fs::create_dir_all(layout.txns_dir())?;

        write_revision_zero(&layout)?;

        io::write_atomic(&layout.current_file(), b"0\n")?;
        io::write_atomic(&layout.txn_current_file(), b"0\n")?;
        io::write_atomic(&layout.min_unpacked_rev_file(), b"0\n")?;
        io::create_empty(&layout.txn_current_lock_file())?;
        io::create_empty(&layout.write_lock_file())?;

        debug!(root = %path.display(), "created repository");
        Self::open(path, config)
    }

    /// Open a handle to an existing repository.
    pub fn open(path: &Path, mut config: FsConfig) -> Result<Self> {
        let probe = Layout::new(path.to_path_buf(), 1);
        let shard_size = read_format(&probe.format_file())?;
        config.max_files_per_dir = shard_size;
        let layout = Layout::new(path.to_path_buf(), shard_size);
        let shared = registry::shared_for(path)?;
        Ok(Self {
            layout,
            config,
            shared,
            youngest_cache: Mutex::new(None),
            min_unpacked_cache: Mutex::new(None),
            has_write_lock: AtomicBool::new(false),
            dir_cache: Mutex::new(HashMap::new()),
            lock_verifier: None,
            warning: Box::new(|err| tracing::warn!(error = %err, "filesystem warning")),
        })
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<FsShared> {
        &self.shared
    }

    /// Install the path-level lock verifier consulted during commit.
    pub fn set_lock_verifier(&mut self, verifier: LockVerifier) {
        self.lock_verifier = Some(verifier);
    }

    #[must_use]
    pub fn lock_verifier(&self) -> Option<&LockVerifier> {
        self.lock_verifier.as_ref()
    }

    /// Install the sink that receives downgraded rep-sharing errors.
    pub fn set_warning_sink(&mut self, sink: WarningSink) {
        self.warning = sink;
    }

    pub fn warn(&self, err: &FsError) {
        (self.warning)(err);
    }

    // --- youngest / min-unpacked ---

    /// The youngest committed revision.
    ///
    /// While the write lock is held the cached value is authoritative
    /// (nobody else can bump `current`); otherwise the `current` file is
    /// re-read.
    pub fn youngest(&self) -> Result<RevisionNumber> {
        if self.has_write_lock.load(Ordering::Acquire) {
            if let Some(rev) = *self.youngest_cache.lock() {
                return Ok(rev);
            }
        }
        let rev = self.read_current()?;
        *self.youngest_cache.lock() = Some(rev);
        Ok(rev)
    }

    fn read_current(&self) -> Result<RevisionNumber> {
        let text = io::read_to_string(&self.layout.current_file())?;
        parse_numbered_file(&text, "current")
    }

    /// Atomically publish a new youngest revision and update the cache.
    /// Caller must hold the write lock.
    pub fn write_current(&self, rev: RevisionNumber) -> Result<()> {
        io::write_atomic(
            &self.layout.current_file(),
            format!("{}\n", rev.get()).as_bytes(),
        )?;
        *self.youngest_cache.lock() = Some(rev);
        Ok(())
    }

    /// First revision not yet packed. This implementation never packs, so
    /// this stays 0 for the life of a repository.
    pub fn min_unpacked_rev(&self) -> Result<RevisionNumber> {
        if let Some(rev) = *self.min_unpacked_cache.lock() {
            return Ok(rev);
        }
        let text = io::read_to_string(&self.layout.min_unpacked_rev_file())?;
        let rev = parse_numbered_file(&text, "min-unpacked-rev")?;
        *self.min_unpacked_cache.lock() = Some(rev);
        Ok(rev)
    }

    // --- locks ---

    /// Run `body` under the global write lock.
    ///
    /// Serializes commits: in-process mutex first, then the advisory lock
    /// on the `write-lock` sentinel. While held, the youngest and
    /// min-unpacked caches are refreshed once and trusted.
    pub fn with_write_lock<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _process = self.shared.write_mutex.lock();
        let file_lock = FileLock::acquire_blocking(&self.layout.write_lock_file())?;
        self.has_write_lock.store(true, Ordering::Release);
        let _flag = resetting(&self.has_write_lock);

        // Nobody else can modify the repository now; refresh cached state.
        *self.min_unpacked_cache.lock() = None;
        self.min_unpacked_rev()?;
        *self.youngest_cache.lock() = Some(self.read_current()?);

        match body() {
            Ok(value) => {
                file_lock.unlock()?;
                Ok(value)
            }
            Err(err) => {
                // Release silently; the body's error is the interesting one.
                drop(file_lock);
                Err(err)
            }
        }
    }

    /// Run `body` under the transaction-counter lock.
    pub fn with_txn_current_lock<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _process = self.shared.txn_current_mutex.lock();
        let file_lock = FileLock::acquire_blocking(&self.layout.txn_current_lock_file())?;
        match body() {
            Ok(value) => {
                file_lock.unlock()?;
                Ok(value)
            }
            Err(err) => {
                drop(file_lock);
                Err(err)
            }
        }
    }

    /// Lock the proto-rev file of `txn_id` and open it positioned at its
    /// end.
    ///
    /// Fails with `RepBeingWritten` if any thread of this process or any
    /// other process currently holds the lock.
    pub fn writable_proto_rev(&self, txn_id: TxnId) -> Result<(std::fs::File, ProtoRevLock)> {
        let file_lock = self.shared.with_txn_list(|registry| {
            let entry = registry.get_or_create(txn_id);
            if entry.being_written {
                return Err(FsError::RepBeingWritten {
                    name: txn_id.name(),
                    who: Writer::ThisProcess,
                });
            }
            // No thread of this process holds the lock, so probing the
            // advisory lock observes other processes only.
            let lock = FileLock::acquire_nonblocking(&self.layout.txn_proto_rev_lock(txn_id))?
                .ok_or_else(|| FsError::RepBeingWritten {
                    name: txn_id.name(),
                    who: Writer::AnotherProcess,
                })?;
            entry.being_written = true;
            Ok(lock)
        })?;

        let lock = ProtoRevLock {
            shared: Arc::clone(&self.shared),
            txn_id,
            file_lock: Some(file_lock),
            released: false,
        };

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.layout.txn_proto_rev(txn_id))
        {
            Ok(file) => file,
            Err(err) => {
                drop(lock);
                return Err(err.into());
            }
        };
        file.seek(SeekFrom::End(0))?;
        Ok((file, lock))
    }

    // --- directory cache ---

    pub fn dir_cache_get(&self, id: &NodeRevId) -> Option<BTreeMap<String, DirEntry>> {
        self.dir_cache.lock().get(id).cloned()
    }

    pub fn dir_cache_set(&self, id: NodeRevId, entries: BTreeMap<String, DirEntry>) {
        self.dir_cache.lock().insert(id, entries);
    }

    /// Partial replacement: update one name in the cached listing, if the
    /// listing is cached at all.
    pub fn dir_cache_replace(&self, id: &NodeRevId, name: &str, entry: Option<DirEntry>) {
        if let Some(entries) = self.dir_cache.lock().get_mut(id) {
            match entry {
                Some(entry) => {
                    entries.insert(name.to_owned(), entry);
                }
                None => {
                    entries.remove(name);
                }
            }
        }
    }

    /// Drop cached listings belonging to `txn_id`.
    pub fn dir_cache_purge_txn(&self, txn_id: TxnId) {
        self.dir_cache
            .lock()
            .retain(|id, _| id.txn_id() != Some(txn_id));
    }
}

/// Exclusive hold on a transaction's proto-rev file: the advisory lock on
/// its `rev-lock` sentinel plus the `being_written` flag in the shared
/// registry. Dropping releases both (best-effort); [`unlock`](Self::unlock)
/// releases and surfaces errors.
pub struct ProtoRevLock {
    shared: Arc<FsShared>,
    txn_id: TxnId,
    file_lock: Option<FileLock>,
    released: bool,
}

impl ProtoRevLock {
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        if let Some(lock) = self.file_lock.take() {
            lock.unlock()?;
        }
        self.shared.clear_being_written(self.txn_id)
    }
}

impl Drop for ProtoRevLock {
    fn drop(&mut self) {
        if !self.released {
            self.file_lock.take();
            let _ = self.shared.clear_being_written(self.txn_id);
        }
    }
}

struct FlagReset<'a>(&'a AtomicBool);

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn resetting(flag: &AtomicBool) -> FlagReset<'_> {
    FlagReset(flag)
}

fn parse_numbered_file(text: &str, what: &str) -> Result<RevisionNumber> {
    text.strip_suffix('\n')
        .and_then(|n| n.parse::<u32>().ok())
        .map(RevisionNumber)
        .ok_or_else(|| FsError::corrupt(format!("malformed '{what}' file")))
}

fn read_format(path: &Path) -> Result<u32> {
    let text = io::read_to_string(path)?;
    let mut lines = text.lines();
    let number: u32 = lines
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| FsError::corrupt("malformed format file"))?;
    if number != FORMAT_NUMBER {
        return Err(FsError::Unsupported {
            detail: format!("format {number} (expected {FORMAT_NUMBER})"),
        });
    }
    let mut shard_size = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("layout ") {
            shard_size = Some(match rest.strip_prefix("sharded ") {
                Some(n) => n
                    .parse::<u32>()
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| FsError::corrupt("malformed layout line in format file"))?,
                None => {
                    return Err(FsError::Unsupported {
                        detail: format!("layout '{rest}'"),
                    });
                }
            });
        } else if let Some(rest) = line.strip_prefix("addressing ") {
            if rest != "logical" {
                return Err(FsError::Unsupported {
                    detail: format!("addressing '{rest}'"),
                });
            }
        }
    }
    shard_size.ok_or_else(|| FsError::corrupt("format file missing layout line"))
}

/// Write the revision-0 files: an empty root directory, an empty
/// changed-paths block, both indexes, and the revprops.
fn write_revision_zero(layout: &Layout) -> Result<()> {
    let rev = RevisionNumber::ZERO;
    let cs = fsvn_types::ChangeSet::Revision(rev);
    let root = NodeRevision {
        id: NodeRevId::new(
            fsvn_types::IdPart::new(cs, 0),
            fsvn_types::IdPart::new(cs, 0),
            fsvn_types::IdPart::new(cs, fsvn_types::id::ITEM_INDEX_ROOT_NODE),
        ),
        kind: NodeKind::Dir,
        predecessor_id: None,
        predecessor_count: 0,
        data_rep: None,
        prop_rep: None,
        created_path: "/".to_owned(),
        copyfrom: None,
        copyroot: None,
        mergeinfo_count: 0,
        has_mergeinfo: false,
        is_fresh_txn_root: false,
    };

    let noderev_bytes = root.unparse().into_bytes();
    let mut rev_file = noderev_bytes.clone();
    let changes_offset = rev_file.len() as u64;
    fsvn_types::encoding::write_hash(&mut rev_file, &BTreeMap::new())?;
    let changes_size = rev_file.len() as u64 - changes_offset;
    io::write_atomic(&layout.rev_file(rev), &rev_file)?;

    index::write_final_l2p(
        &layout.l2p_file(rev),
        vec![
            L2pEntry {
                item: fsvn_types::id::ITEM_INDEX_ROOT_NODE,
                offset: 0,
            },
            L2pEntry {
                item: ITEM_INDEX_CHANGES,
                offset: changes_offset,
            },
        ],
    )?;
    index::write_final_p2l(
        &layout.p2l_file(rev),
        vec![
            P2lEntry {
                offset: 0,
                size: noderev_bytes.len() as u64,
                item_type: ItemType::NodeRev,
                item: fsvn_types::id::ITEM_INDEX_ROOT_NODE,
            },
            P2lEntry {
                offset: changes_offset,
                size: changes_size,
                item_type: ItemType::Changes,
                item: ITEM_INDEX_CHANGES,
            },
        ],
    )?;

    let mut props = BTreeMap::new();
    props.insert(
        PROP_REVISION_DATE.to_owned(),
        revprops::format_date_now().into_bytes(),
    );
    io::write_atomic(
        &layout.revprops_file(rev),
        &revprops::serialize_props(&props)?,
    )
}
