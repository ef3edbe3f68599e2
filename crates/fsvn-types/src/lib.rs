//! Core types for the FrankenSVN revision store.
//!
//! Identifier newtypes, the tagged change-set, checksums, the keyed text
//! encodings shared by transaction scratch files and committed revision
//! files, and path helpers. Everything here is I/O-free; the `fsvn-fs`
//! crate owns the on-disk layout.

pub mod change;
pub mod checksum;
pub mod encoding;
pub mod fspath;
pub mod id;
pub mod noderev;
pub mod rep;

pub use change::{ChangeKind, PathChange};
pub use checksum::{Md5, Sha1};
pub use id::{ChangeSet, IdPart, NodeRevId, TxnId};
pub use noderev::{DirEntry, NodeRevision};
pub use rep::{RepId, Representation};

use std::fmt;

use fsvn_error::FsError;

/// A revision number.
///
/// Revisions are numbered from 0 (the empty tree) and increase by exactly
/// one per successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RevisionNumber(pub u32);

impl RevisionNumber {
    /// Revision 0, the empty tree every repository starts with.
    pub const ZERO: Self = Self(0);

    /// The next revision number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The raw numeric value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RevisionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RevisionNumber {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| FsError::corrupt(format!("invalid revision number '{s}'")))
    }
}

/// Kind of a node in the versioned tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    /// Keyword used in serialized records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }

    /// Parse the serialized keyword.
    pub fn parse(s: &str) -> Result<Self, FsError> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            other => Err(FsError::corrupt(format!("unknown node kind '{other}'"))),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
