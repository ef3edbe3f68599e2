//! Representations: stored byte sequences referenced by node-revisions.

use std::fmt;

use fsvn_error::FsError;

use crate::checksum::{Md5, Sha1};
use crate::id::ChangeSet;

/// The identity of a representation: the change set it was written in plus
/// its item index within that change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepId {
    pub change_set: ChangeSet,
    pub number: u64,
}

/// A stored (possibly delta-encoded) byte sequence.
///
/// A representation whose change set is a transaction is mutable; one whose
/// change set is a revision is immutable and may be shared by any number of
/// node-revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub id: RepId,
    /// Size of the encoded payload between the header and `ENDREP`.
    pub size: u64,
    /// Size of the fully expanded content.
    pub expanded_size: u64,
    /// Authoritative content checksum.
    pub md5: Md5,
    /// Content address for rep sharing. Dropped at serialization time for
    /// directory and property reps.
    pub sha1: Option<Sha1>,
}

impl Representation {
    /// True if this representation may still be appended to or retargeted.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.id.change_set.is_txn()
    }

    /// Serialized form:
    /// `<change-set> <item> <size> <expanded-size> <md5> [<sha1>]`.
    pub fn parse(s: &str) -> Result<Self, FsError> {
        let mut fields = s.split(' ');
        let (Some(cs), Some(number), Some(size), Some(expanded), Some(md5)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(FsError::corrupt(format!("malformed representation '{s}'")));
        };
        let sha1 = fields.next().map(Sha1::from_hex).transpose()?;
        if fields.next().is_some() {
            return Err(FsError::corrupt(format!("malformed representation '{s}'")));
        }
        let number = number
            .parse()
            .map_err(|_| FsError::corrupt(format!("malformed representation item '{number}'")))?;
        let parse_u64 = |field: &str| {
            field
                .parse::<u64>()
                .map_err(|_| FsError::corrupt(format!("malformed representation size '{field}'")))
        };
        Ok(Self {
            id: RepId {
                change_set: ChangeSet::parse(cs)?,
                number,
            },
            size: parse_u64(size)?,
            expanded_size: parse_u64(expanded)?,
            md5: Md5::from_hex(md5)?,
            sha1,
        })
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.id.change_set, self.id.number, self.size, self.expanded_size, self.md5
        )?;
        if let Some(sha1) = &self.sha1 {
            write!(f, " {sha1}")?;
        }
        Ok(())
    }
}
