use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for FrankenSVN operations.
///
/// Structured variants for the conditions the commit engine can hit, with
/// contextual fields where a caller (or a log line) needs them. The variant
/// set doubles as the domain error taxonomy: callers match on variants, not
/// on message strings.
#[derive(Error, Debug)]
pub enum FsError {
    // === Repository structure ===
    /// On-disk structure violates a repository invariant.
    #[error("corrupt filesystem: {detail}")]
    Corrupt { detail: String },

    /// Internal invariant violation; never expected in a healthy process.
    #[error("malfunction: {0}")]
    Malfunction(String),

    /// The repository format file declares a capability we do not support.
    #[error("unsupported filesystem format: {detail}")]
    Unsupported { detail: String },

    // === Transactions ===
    /// The transaction's base revision is no longer the youngest revision.
    #[error("transaction out of date: based on r{base_rev}, youngest is r{youngest}")]
    TxnOutOfDate { base_rev: u32, youngest: u32 },

    /// `open` was called for a transaction that does not exist on disk.
    #[error("no such transaction '{name}'")]
    NoSuchTransaction { name: String },

    /// Another thread or process is writing to this transaction's proto-rev
    /// file.
    #[error("proto-rev file of transaction '{name}' is being written by {who}")]
    RepBeingWritten { name: String, who: Writer },

    // === Tree shape ===
    /// A file operation was attempted on a directory node.
    #[error("'{path}' is not a file")]
    NotFile { path: String },

    /// A directory operation was attempted on a file node.
    #[error("'{path}' is not a directory")]
    NotDir { path: String },

    /// Path lookup failed below a revision root.
    #[error("path '{path}' not found in r{rev}")]
    PathNotFound { path: String, rev: u32 },

    /// A node already exists where one was to be created.
    #[error("path '{path}' already exists")]
    AlreadyExists { path: String },

    // === Moves ===
    /// Two moves in the same commit claim the same source path.
    #[error("path '{path}' has been moved to more than one target")]
    AmbiguousMove { path: String },

    /// A move's source path was never deleted in the same commit.
    #[error("path '{path}' has been moved without being deleted")]
    IncompleteMove { path: String },

    // === Checksums ===
    /// An unknown checksum kind was named in serialized data.
    #[error("unknown checksum kind '{kind}'")]
    BadChecksumKind { kind: String },

    /// A checksum hex string failed to parse.
    #[error("malformed {kind} checksum '{hex}'")]
    BadChecksumParse { kind: &'static str, hex: String },

    /// Reconstructed content did not match its recorded digest.
    #[error("checksum mismatch for {item}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        item: String,
        expected: String,
        actual: String,
    },

    // === Locking ===
    /// Advisory file locking failed for a reason other than contention.
    #[error("cannot lock '{path}': {detail}")]
    LockFailed { path: PathBuf, detail: String },

    // === I/O ===
    /// Filesystem primitive failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who holds a contended proto-rev lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    ThisProcess,
    AnotherProcess,
}

impl std::fmt::Display for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThisProcess => f.write_str("this process"),
            Self::AnotherProcess => f.write_str("another process"),
        }
    }
}

impl FsError {
    /// Create a `Corrupt` error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a `Malfunction` error.
    pub fn malfunction(detail: impl Into<String>) -> Self {
        Self::Malfunction(detail.into())
    }

    /// Whether this is a transient error that may succeed on retry.
    ///
    /// `TxnOutOfDate` is retriable at a higher level (rebase the transaction
    /// and try again); `RepBeingWritten` just needs the other writer to
    /// finish.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TxnOutOfDate { .. } | Self::RepBeingWritten { .. }
        )
    }

    /// Whether a rep-sharing lookup failure with this error must abort the
    /// commit instead of degrading to a cache miss.
    ///
    /// Corruption and malfunctions indicate the rep-sharing index refers to
    /// state that cannot be trusted (e.g. forward-dated rows), so masking
    /// them would persist the damage.
    #[must_use]
    pub const fn is_fatal_for_rep_sharing(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Malfunction(_))
    }
}

/// Result type alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
