//! Node-revisions and directory entries, with their keyed text encoding.
//!
//! A node-revision is serialized as a block of `key: value` lines followed
//! by a blank line:
//!
//! ```text
//! id: t1-0.t1-0.t1-2
//! type: dir
//! pred: r0-0.r0-0.r0-2
//! count: 1
//! text: t1 0 0 0 d41d8cd98f00b204e9800998ecf8427e
//! cpath: /
//!
//! ```
//!
//! Optional keys (`props`, `copyfrom`, `copyroot`, `minfo-here`,
//! `minfo-cnt`, `is-fresh-txn-root`) are omitted when at their defaults.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::BufRead;

use fsvn_error::{FsError, Result};

use crate::id::NodeRevId;
use crate::rep::Representation;
use crate::{NodeKind, RevisionNumber};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

impl DirEntry {
    /// Serialized as the value of a directory hash entry: `<kind> <id>`.
    #[must_use]
    pub fn unparse(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(' ')
            .ok_or_else(|| FsError::corrupt(format!("malformed directory entry '{s}'")))?;
        Ok(Self {
            kind: NodeKind::parse(kind)?,
            id: NodeRevId::parse(id)?,
        })
    }
}

/// A node-revision: one version of one node in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    /// Number of predecessors along the `predecessor_id` chain.
    pub predecessor_count: u32,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// Canonical path this node-revision was created at.
    pub created_path: String,
    pub copyfrom: Option<(RevisionNumber, String)>,
    /// Root of the copy this node was created under; `None` means the node
    /// is its own copy root.
    pub copyroot: Option<(RevisionNumber, String)>,
    pub mergeinfo_count: u64,
    pub has_mergeinfo: bool,
    /// Set on the unmodified root node-rev a fresh transaction starts with.
    /// Always cleared when the node-rev is written into a revision.
    pub is_fresh_txn_root: bool,
}

impl NodeRevision {
    /// Serialize as a keyed text block terminated by a blank line.
    #[must_use]
    pub fn unparse(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "id: {}", self.id);
        let _ = writeln!(out, "type: {}", self.kind);
        if let Some(pred) = &self.predecessor_id {
            let _ = writeln!(out, "pred: {pred}");
        }
        let _ = writeln!(out, "count: {}", self.predecessor_count);
        if let Some(rep) = &self.data_rep {
            let _ = writeln!(out, "text: {rep}");
        }
        if let Some(rep) = &self.prop_rep {
            let _ = writeln!(out, "props: {rep}");
        }
        let _ = writeln!(out, "cpath: {}", self.created_path);
        if let Some((rev, path)) = &self.copyfrom {
            let _ = writeln!(out, "copyfrom: {rev} {path}");
        }
        if let Some((rev, path)) = &self.copyroot {
            let _ = writeln!(out, "copyroot: {rev} {path}");
        }
        if self.has_mergeinfo {
            let _ = writeln!(out, "minfo-here: y");
        }
        if self.mergeinfo_count > 0 {
            let _ = writeln!(out, "minfo-cnt: {}", self.mergeinfo_count);
        }
        if self.is_fresh_txn_root {
            let _ = writeln!(out, "is-fresh-txn-root: y");
        }
        out.push('\n');
        out
    }

    /// Parse a keyed text block. Stops at the terminating blank line or end
    /// of input.
    pub fn parse<R: BufRead>(input: &mut R) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        loop {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| FsError::corrupt(format!("malformed node-revision line '{line}'")))?;
            fields.insert(key.to_owned(), value.to_owned());
        }

        let require = |key: &str| {
            fields
                .get(key)
                .ok_or_else(|| FsError::corrupt(format!("node-revision missing '{key}' field")))
        };
        let rev_path = |value: &str| -> Result<(RevisionNumber, String)> {
            let (rev, path) = value
                .split_once(' ')
                .ok_or_else(|| FsError::corrupt(format!("malformed rev/path pair '{value}'")))?;
            Ok((rev.parse()?, path.to_owned()))
        };

        Ok(Self {
            id: NodeRevId::parse(require("id")?)?,
            kind: NodeKind::parse(require("type")?)?,
            predecessor_id: fields.get("pred").map(|v| NodeRevId::parse(v)).transpose()?,
            predecessor_count: require("count")?
                .parse()
                .map_err(|_| FsError::corrupt("malformed predecessor count"))?,
            data_rep: fields
                .get("text")
                .map(|v| Representation::parse(v))
                .transpose()?,
            prop_rep: fields
                .get("props")
                .map(|v| Representation::parse(v))
                .transpose()?,
            created_path: require("cpath")?.clone(),
            copyfrom: fields.get("copyfrom").map(|v| rev_path(v)).transpose()?,
            copyroot: fields.get("copyroot").map(|v| rev_path(v)).transpose()?,
            mergeinfo_count: fields
                .get("minfo-cnt")
                .map(|v| {
                    v.parse()
                        .map_err(|_| FsError::corrupt("malformed mergeinfo count"))
                })
                .transpose()?
                .unwrap_or(0),
            has_mergeinfo: fields.get("minfo-here").map(String::as_str) == Some("y"),
            is_fresh_txn_root: fields.get("is-fresh-txn-root").map(String::as_str) == Some("y"),
        })
    }
}
