//! Advisory file locks.
//!
//! All four repository locks are whole-file POSIX `fcntl` locks on
//! zero-byte sentinel files. POSIX locks are per-process, so in-process
//! exclusion is provided separately by the mutexes in
//! [`crate::registry::FsShared`]; the file locks only arbitrate between
//! processes. Each sentinel is locked through its own dedicated file
//! descriptor that stays open for the lifetime of the guard, so the
//! "closing any fd drops the process' locks" trap cannot bite.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use fsvn_error::{FsError, Result};

/// Attempt a POSIX advisory lock over the whole file via `fcntl`.
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if a
/// non-blocking attempt would block, and `Err` for real I/O errors.
fn posix_lock(file: &impl AsFd, lock_type: i32, blocking: bool) -> Result<bool> {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    let arg = if blocking {
        nix::fcntl::FcntlArg::F_SETLKW(&flock)
    } else {
        nix::fcntl::FcntlArg::F_SETLK(&flock)
    };
    match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(FsError::Io(e.into())),
    }
}

fn posix_unlock(file: &impl AsFd) -> Result<()> {
    let ok = posix_lock(file, libc::F_UNLCK, false)?;
    debug_assert!(ok, "F_UNLCK should never fail with EAGAIN");
    Ok(())
}

/// An exclusive advisory lock on a sentinel file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Lock `path` exclusively, blocking until the lock is granted.
    ///
    /// If the sentinel file does not exist it is created and the
    /// acquisition retried exactly once; sentinels are just empty files.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        match Self::try_open_and_lock(path, true)? {
            LockAttempt::Held(lock) => Ok(lock),
            LockAttempt::Missing => {
                File::create(path)?;
                match Self::try_open_and_lock(path, true)? {
                    LockAttempt::Held(lock) => Ok(lock),
                    _ => Err(FsError::LockFailed {
                        path: path.to_owned(),
                        detail: "sentinel file vanished after creation".to_owned(),
                    }),
                }
            }
            LockAttempt::Contended => unreachable!("blocking lock cannot be contended"),
        }
    }

    /// Lock `path` exclusively without blocking, creating the sentinel if
    /// missing. Returns `None` when another process holds the lock.
    pub fn acquire_nonblocking(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if posix_lock(&file, libc::F_WRLCK, false)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }

    fn try_open_and_lock(path: &Path, blocking: bool) -> Result<LockAttempt> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LockAttempt::Missing);
            }
            Err(err) => return Err(err.into()),
        };
        if posix_lock(&file, libc::F_WRLCK, blocking)? {
            Ok(LockAttempt::Held(Self { file }))
        } else {
            Ok(LockAttempt::Contended)
        }
    }

    /// Release explicitly, surfacing unlock errors. Dropping the guard
    /// releases as well, silently.
    pub fn unlock(self) -> Result<()> {
        posix_unlock(&self.file)
        // `self.file` closes on return, which would release the lock anyway.
    }
}

enum LockAttempt {
    Held(FileLock),
    Contended,
    Missing,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = posix_unlock(&self.file);
    }
}
