//! Small filesystem primitives shared by the store.
//!
//! The publish steps of the commit pipeline rely on two properties
//! provided here: `write_unique` + `move_into_place` gives
//! write-temp-then-rename atomicity, and `move_into_place` flushes the
//! destination directory so the rename survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fsvn_error::{FsError, Result};

/// Read a whole file into a string.
pub fn read_to_string(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?)
}

/// Create an empty file, truncating any existing one.
pub fn create_empty(path: &Path) -> Result<()> {
    File::create(path)?;
    Ok(())
}

/// Open a file for appending, creating it if needed.
pub fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Write `contents` to a fresh uniquely-named sibling of `target` and
/// return its path. Pair with [`move_into_place`].
pub fn write_unique(target: &Path, contents: &[u8]) -> Result<std::path::PathBuf> {
    let dir = target
        .parent()
        .ok_or_else(|| FsError::malfunction(format!("'{}' has no parent", target.display())))?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FsError::malfunction(format!("'{}' has no file name", target.display())))?;
    // Uniqueness across processes is enough; concurrent writers of the
    // same target hold the lock that guards it.
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let unique = dir.join(format!("{name}.{}-{seq}.tmp", std::process::id()));
    let mut file = File::create(&unique)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(unique)
}

/// Atomically rename `from` onto `to` and flush the containing directory.
pub fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to)?;
    if let Some(dir) = to.parent() {
        // Failure to open the directory for fsync is not fatal on
        // filesystems that do not support it.
        if let Ok(dirfd) = File::open(dir) {
            let _ = dirfd.sync_all();
        }
    }
    Ok(())
}

/// Write-temp-then-rename convenience.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    let tmp = write_unique(target, contents)?;
    move_into_place(&tmp, target)
}

/// Copy the permission bits of `reference` onto `target`. Used when a
/// renamed file should match its published siblings.
pub fn copy_perms(reference: &Path, target: &Path) -> Result<()> {
    let perms = fs::metadata(reference)?.permissions();
    fs::set_permissions(target, perms)?;
    Ok(())
}

/// Remove a file, ignoring a missing one.
pub fn remove_file_ignore_enoent(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Create a directory, ignoring an already existing one; copy the mode
/// bits of `perms_from` onto it.
pub fn make_dir_copy_perms(dir: &Path, perms_from: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err.into()),
    }
    let perms = fs::metadata(perms_from)?.permissions();
    fs::set_permissions(dir, perms)?;
    Ok(())
}
