//! Shared value types: revision numbers, node kinds, change actions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Revision number
pub type Revnum = u64;

/// Cancellation predicate; returns true when the caller wants to stop.
pub type CancelFn<'a> = &'a (dyn Fn() -> bool + 'a);

/// A cancellation predicate that never fires
pub fn never_cancel() -> bool {
    false
}

/// Return `Err(Cancelled)` if the predicate fires.
pub(crate) fn check_cancel(cancel: CancelFn<'_>) -> crate::Result<()> {
    if cancel() {
        Err(crate::ReposError::Cancelled)
    } else {
        Ok(())
    }
}

/// Lowercase hex SHA-1 of `data`, the checksum used by editors and dump streams
pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(data))
}

/// Kind of a node in a tree snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
    /// Nothing exists at the path
    None,
    Unknown,
}

impl NodeKind {
    /// Tag used in dump streams
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
            NodeKind::None => "none",
            NodeKind::Unknown => "unknown",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "file" => Some(NodeKind::File),
            "dir" => Some(NodeKind::Dir),
            "none" => Some(NodeKind::None),
            "unknown" => Some(NodeKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action of a node relative to a comparison baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAction {
    Add,
    Delete,
    Replace,
    /// Unchanged identity with modified text and/or properties
    Modify,
}

impl NodeAction {
    /// Single-letter code used in logs and hook payloads
    pub fn code(&self) -> char {
        match self {
            NodeAction::Add => 'A',
            NodeAction::Delete => 'D',
            NodeAction::Replace => 'R',
            NodeAction::Modify => 'M',
        }
    }

    /// Tag used in dump streams
    pub fn dump_tag(&self) -> &'static str {
        match self {
            NodeAction::Add => "add",
            NodeAction::Delete => "delete",
            NodeAction::Replace => "replace",
            NodeAction::Modify => "change",
        }
    }

    pub fn parse_dump_tag(tag: &str) -> Option<Self> {
        match tag {
            "add" => Some(NodeAction::Add),
            "delete" => Some(NodeAction::Delete),
            "replace" => Some(NodeAction::Replace),
            "change" => Some(NodeAction::Modify),
            _ => None,
        }
    }
}

/// Copy source of an added node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyFrom {
    pub path: String,
    pub rev: Revnum,
}

impl CopyFrom {
    pub fn new(path: impl Into<String>, rev: Revnum) -> Self {
        Self {
            path: crate::path::canonicalize(&path.into()),
            rev,
        }
    }
}

impl fmt::Display for CopyFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        for kind in [NodeKind::File, NodeKind::Dir, NodeKind::None, NodeKind::Unknown] {
            assert_eq!(NodeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NodeKind::parse("symlink"), None);
    }

    #[test]
    fn test_action_tags() {
        assert_eq!(NodeAction::parse_dump_tag("change"), Some(NodeAction::Modify));
        assert_eq!(NodeAction::Replace.code(), 'R');
        assert_eq!(NodeAction::parse_dump_tag("move"), None);
    }

    #[test]
    fn test_sha1_hex() {
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_copy_from_canonical() {
        let cf = CopyFrom::new("trunk/", 3);
        assert_eq!(cf.path, "/trunk");
        assert_eq!(cf.to_string(), "/trunk@3");
    }
}
