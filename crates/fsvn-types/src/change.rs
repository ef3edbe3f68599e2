//! Changed-path records.

use std::fmt;

use fsvn_error::{FsError, Result};

use crate::id::NodeRevId;
use crate::{NodeKind, RevisionNumber};

/// What happened to a path in a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
    /// Remove all previously recorded changes for the path.
    Reset,
    Move,
    MoveReplace,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Modify => "modify",
            Self::Reset => "reset",
            Self::Move => "move",
            Self::MoveReplace => "movereplace",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "delete" => Ok(Self::Delete),
            "replace" => Ok(Self::Replace),
            "modify" => Ok(Self::Modify),
            "reset" => Ok(Self::Reset),
            "move" => Ok(Self::Move),
            "movereplace" => Ok(Self::MoveReplace),
            other => Err(FsError::corrupt(format!("unknown change kind '{other}'"))),
        }
    }

    /// True for the kinds that remove whatever previously lived at the path
    /// (and therefore invalidate folded changes on descendants).
    #[must_use]
    pub const fn is_deletion(self) -> bool {
        matches!(self, Self::Delete | Self::Replace | Self::MoveReplace)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change record for one path.
///
/// In the transaction changes log these are raw, in stream order; after
/// folding there is at most one per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub kind: ChangeKind,
    /// Absent only for `reset` records.
    pub node_rev_id: Option<NodeRevId>,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub node_kind: Option<NodeKind>,
    pub copyfrom: Option<(RevisionNumber, String)>,
}

impl PathChange {
    /// Serialized as the value of a changed-path hash entry:
    /// `<id|-> <kind> <text-mod> <prop-mod> <node-kind|-> [<rev> <path>]`.
    #[must_use]
    pub fn unparse(&self) -> String {
        let mut out = format!(
            "{} {} {} {} {}",
            self.node_rev_id
                .as_ref()
                .map_or_else(|| "-".to_owned(), NodeRevId::to_string),
            self.kind,
            self.text_mod,
            self.prop_mod,
            self.node_kind.map_or("-", NodeKind::as_str),
        );
        if let Some((rev, path)) = &self.copyfrom {
            out.push_str(&format!(" {rev} {path}"));
        }
        out
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut fields = s.splitn(6, ' ');
        let (Some(id), Some(kind), Some(text_mod), Some(prop_mod), Some(node_kind)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(FsError::corrupt(format!("malformed change record '{s}'")));
        };
        let parse_bool = |field: &str| match field {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(FsError::corrupt(format!(
                "malformed change flag '{other}'"
            ))),
        };
        let copyfrom = fields
            .next()
            .map(|rest| -> Result<(RevisionNumber, String)> {
                let (rev, path) = rest.split_once(' ').ok_or_else(|| {
                    FsError::corrupt(format!("malformed copy-from in change record '{s}'"))
                })?;
                Ok((rev.parse()?, path.to_owned()))
            })
            .transpose()?;
        Ok(Self {
            kind: ChangeKind::parse(kind)?,
            node_rev_id: (id != "-").then(|| NodeRevId::parse(id)).transpose()?,
            text_mod: parse_bool(text_mod)?,
            prop_mod: parse_bool(prop_mod)?,
            node_kind: (node_kind != "-").then(|| NodeKind::parse(node_kind)).transpose()?,
            copyfrom,
        })
    }
}
