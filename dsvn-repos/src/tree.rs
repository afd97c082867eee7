//! Tree snapshots and node revisions
//!
//! A tree is a persistent structure of `Arc<NodeRev>`: every revision shares
//! all unchanged subtrees with its predecessor, and a transaction copies only
//! the spine from the root down to each path it touches. Nodes touched by a
//! transaction are flagged mutable and receive their `created_rev` when the
//! transaction is committed.

use crate::error::{ReposError, Result};
use crate::path;
use crate::props::PropertySet;
use crate::types::{CopyFrom, NodeAction, NodeKind, Revnum};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Content identity of a file text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity shared by every version of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(uuid::Uuid);

impl NodeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// File text or directory entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeContent {
    File { text: Bytes, text_id: ObjectId },
    Dir { entries: BTreeMap<String, Arc<NodeRev>> },
}

/// One version of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRev {
    pub node_id: NodeId,
    /// Revision that created this version; bubbled up to ancestors
    pub created_rev: Revnum,
    pub copy_from: Option<CopyFrom>,
    pub props: PropertySet,
    pub content: NodeContent,
    #[serde(skip)]
    mutable: bool,
}

impl NodeRev {
    /// New empty directory, owned by a transaction
    pub fn new_dir() -> Self {
        Self {
            node_id: NodeId::generate(),
            created_rev: 0,
            copy_from: None,
            props: PropertySet::new(),
            content: NodeContent::Dir {
                entries: BTreeMap::new(),
            },
            mutable: true,
        }
    }

    /// New empty file, owned by a transaction
    pub fn new_file() -> Self {
        Self {
            node_id: NodeId::generate(),
            created_rev: 0,
            copy_from: None,
            props: PropertySet::new(),
            content: NodeContent::File {
                text: Bytes::new(),
                text_id: ObjectId::from_data(&[]),
            },
            mutable: true,
        }
    }

    /// A copy of `source` as a new node recording where it came from
    pub fn copied_from(source: &NodeRev, copy_from: CopyFrom) -> Self {
        Self {
            node_id: NodeId::generate(),
            copy_from: Some(copy_from),
            mutable: true,
            ..source.clone()
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.content {
            NodeContent::File { .. } => NodeKind::File,
            NodeContent::Dir { .. } => NodeKind::Dir,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, NodeContent::Dir { .. })
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn text(&self) -> Option<&Bytes> {
        match &self.content {
            NodeContent::File { text, .. } => Some(text),
            NodeContent::Dir { .. } => None,
        }
    }

    pub fn text_id(&self) -> Option<ObjectId> {
        match &self.content {
            NodeContent::File { text_id, .. } => Some(*text_id),
            NodeContent::Dir { .. } => None,
        }
    }

    pub fn entries(&self) -> Option<&BTreeMap<String, Arc<NodeRev>>> {
        match &self.content {
            NodeContent::Dir { entries } => Some(entries),
            NodeContent::File { .. } => None,
        }
    }

    pub fn set_text(&mut self, data: Bytes) -> Result<()> {
        match &mut self.content {
            NodeContent::File { text, text_id } => {
                *text_id = ObjectId::from_data(&data);
                *text = data;
                Ok(())
            }
            NodeContent::Dir { .. } => Err(ReposError::NotAFile(String::new())),
        }
    }

    /// Same node and same version: nothing beneath it can differ
    pub fn same_version(&self, other: &NodeRev) -> bool {
        !self.mutable
            && !other.mutable
            && self.node_id == other.node_id
            && self.created_rev == other.created_rev
    }

    /// Same node, possibly a different version
    pub fn related(&self, other: &NodeRev) -> bool {
        self.node_id == other.node_id
    }
}

/// Root of a tree snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    root: Arc<NodeRev>,
}

impl Tree {
    /// Tree holding only an empty root directory created in `rev`
    pub fn empty(rev: Revnum) -> Self {
        let mut root = NodeRev::new_dir();
        root.created_rev = rev;
        root.mutable = false;
        Self {
            root: Arc::new(root),
        }
    }

    pub fn root(&self) -> &Arc<NodeRev> {
        &self.root
    }

    /// Look up a node by absolute path
    pub fn get(&self, path: &str) -> Option<&Arc<NodeRev>> {
        let mut node = &self.root;
        for name in path::components(path) {
            node = node.entries()?.get(name)?;
        }
        Some(node)
    }

    pub fn node(&self, path: &str) -> Result<&Arc<NodeRev>> {
        self.get(path)
            .ok_or_else(|| ReposError::not_found(path, "tree"))
    }

    pub fn kind(&self, path: &str) -> NodeKind {
        self.get(path).map(|n| n.kind()).unwrap_or(NodeKind::None)
    }

    pub fn file_text(&self, path: &str) -> Result<Bytes> {
        self.node(path)?
            .text()
            .cloned()
            .ok_or_else(|| ReposError::NotAFile(path.to_string()))
    }

    pub fn dir_entries(&self, path: &str) -> Result<&BTreeMap<String, Arc<NodeRev>>> {
        self.node(path)?
            .entries()
            .ok_or_else(|| ReposError::NotADirectory(path.to_string()))
    }

    /// Mutable access to the node at `path`, path-copying from the root and
    /// marking every node on the way as mutable.
    pub(crate) fn node_mut(&mut self, path: &str) -> Result<&mut NodeRev> {
        let comps: Vec<&str> = path::components(path).collect();
        mutable_node(&mut self.root, &comps, path)
    }

    /// Insert a new entry; fails if the name is taken.
    pub(crate) fn add_entry(&mut self, parent: &str, name: &str, node: Arc<NodeRev>) -> Result<()> {
        let full = path::join(parent, name);
        match &mut self.node_mut(parent)?.content {
            NodeContent::Dir { entries } => {
                if entries.contains_key(name) {
                    return Err(ReposError::AlreadyExists(full));
                }
                entries.insert(name.to_string(), node);
                Ok(())
            }
            NodeContent::File { .. } => Err(ReposError::NotADirectory(parent.to_string())),
        }
    }

    /// Insert or replace the node at `path`; the parent must exist.
    pub(crate) fn put(&mut self, path: &str, node: Arc<NodeRev>) -> Result<()> {
        let parent = path::dirname(path);
        let name = path::basename(path);
        if name.is_empty() {
            self.root = node;
            return Ok(());
        }
        match &mut self.node_mut(parent)?.content {
            NodeContent::Dir { entries } => {
                entries.insert(name.to_string(), node);
                Ok(())
            }
            NodeContent::File { .. } => Err(ReposError::NotADirectory(parent.to_string())),
        }
    }

    /// Remove and return the node at `path`.
    pub(crate) fn remove(&mut self, path: &str) -> Result<Arc<NodeRev>> {
        let parent = path::dirname(path);
        let name = path::basename(path);
        if name.is_empty() {
            return Err(ReposError::protocol("cannot delete the root directory"));
        }
        if self.get(path).is_none() {
            return Err(ReposError::not_found(path, "tree"));
        }
        match &mut self.node_mut(parent)?.content {
            NodeContent::Dir { entries } => entries
                .remove(name)
                .ok_or_else(|| ReposError::not_found(path, "tree")),
            NodeContent::File { .. } => Err(ReposError::NotADirectory(parent.to_string())),
        }
    }

    /// Give every mutable node its final revision and freeze it.
    pub(crate) fn stamp(&mut self, rev: Revnum) {
        if self.root.mutable {
            stamp_node(&mut self.root, rev);
        }
    }

    /// Flatten into path -> (kind, props, text); identities are left out so
    /// two trees with the same content compare equal.
    pub fn flatten(&self) -> BTreeMap<String, FlatNode> {
        let mut out = BTreeMap::new();
        flatten_into(&self.root, "/", &mut out);
        out
    }
}

/// Content of one path as returned by [`Tree::flatten`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatNode {
    pub kind: NodeKind,
    pub props: PropertySet,
    pub text: Option<Bytes>,
}

fn flatten_into(node: &NodeRev, at: &str, out: &mut BTreeMap<String, FlatNode>) {
    out.insert(
        at.to_string(),
        FlatNode {
            kind: node.kind(),
            props: node.props.clone(),
            text: node.text().cloned(),
        },
    );
    if let Some(entries) = node.entries() {
        for (name, child) in entries {
            flatten_into(child, &path::join(at, name), out);
        }
    }
}

fn mutable_node<'a>(node: &'a mut Arc<NodeRev>, comps: &[&str], full: &str) -> Result<&'a mut NodeRev> {
    let n = Arc::make_mut(node);
    n.mutable = true;
    match comps.split_first() {
        None => Ok(n),
        Some((first, rest)) => match &mut n.content {
            NodeContent::Dir { entries } => {
                let child = entries
                    .get_mut(*first)
                    .ok_or_else(|| ReposError::not_found(full, "tree"))?;
                mutable_node(child, rest, full)
            }
            NodeContent::File { .. } => Err(ReposError::NotADirectory(full.to_string())),
        },
    }
}

fn stamp_node(node: &mut Arc<NodeRev>, rev: Revnum) {
    let n = Arc::make_mut(node);
    n.created_rev = rev;
    n.mutable = false;
    if let NodeContent::Dir { entries } = &mut n.content {
        for child in entries.values_mut() {
            if child.mutable {
                stamp_node(child, rev);
            }
        }
    }
}

/// One changed path of a transaction or revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub action: NodeAction,
    pub kind: NodeKind,
    pub copy_from: Option<CopyFrom>,
    pub text_mod: bool,
    pub prop_mod: bool,
}

impl ChangedPath {
    pub fn new(path: &str, action: NodeAction, kind: NodeKind) -> Self {
        Self {
            path: path.to_string(),
            action,
            kind,
            copy_from: None,
            text_mod: false,
            prop_mod: false,
        }
    }
}

/// Fold one more change of a path into the accumulated changes.
///
/// Add-then-delete cancels out, delete-then-add becomes a replace, and a
/// modification of an added node stays an add.
pub fn fold_change(changes: &mut BTreeMap<String, ChangedPath>, change: ChangedPath) -> Result<()> {
    use NodeAction::*;

    if change.action == Delete {
        let prefix = format!("{}/", change.path.trim_end_matches('/'));
        changes.retain(|p, _| !p.starts_with(&prefix));
    }

    let folded = match changes.remove(&change.path) {
        None => Some(change),
        Some(prev) => match (prev.action, change.action) {
            (Delete, Modify) | (Delete, Delete) => {
                return Err(ReposError::protocol(format!(
                    "change to deleted path '{}'",
                    change.path
                )))
            }
            (Delete, Add) | (Delete, Replace) | (Replace, Replace) | (Add, Replace) | (Modify, Replace) => {
                Some(ChangedPath {
                    action: Replace,
                    ..change
                })
            }
            (Add, Delete) => None,
            (Replace, Delete) | (Modify, Delete) => Some(change),
            (Add, Modify) | (Replace, Modify) | (Modify, Modify) => Some(ChangedPath {
                text_mod: prev.text_mod || change.text_mod,
                prop_mod: prev.prop_mod || change.prop_mod,
                ..prev
            }),
            (Add, Add) | (Replace, Add) | (Modify, Add) => {
                return Err(ReposError::AlreadyExists(change.path))
            }
        },
    };
    if let Some(c) = folded {
        changes.insert(c.path.clone(), c);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(text: &str) -> Arc<NodeRev> {
        let mut f = NodeRev::new_file();
        f.set_text(Bytes::from(text.to_string())).unwrap();
        Arc::new(f)
    }

    #[test]
    fn test_equal_texts_share_text_id() {
        let (a, b, c) = (file("hello world"), file("hello world"), file("hello"));
        assert_eq!(a.text_id(), b.text_id());
        assert_ne!(a.text_id(), c.text_id());
        assert_eq!(NodeRev::new_dir().text_id(), None);
        let shown = a.text_id().unwrap().to_string();
        assert_eq!(shown.len(), 64);
        assert_eq!(shown, ObjectId::from_data(b"hello world").to_hex());
    }

    #[test]
    fn test_path_copy_leaves_base_untouched() {
        let mut base = Tree::empty(0);
        base.add_entry("/", "a", Arc::new(NodeRev::new_dir())).unwrap();
        base.add_entry("/a", "f.txt", file("one")).unwrap();
        base.stamp(1);

        let mut next = base.clone();
        next.node_mut("/a/f.txt").unwrap().set_text(Bytes::from_static(b"two")).unwrap();
        next.stamp(2);

        assert_eq!(base.file_text("/a/f.txt").unwrap(), Bytes::from_static(b"one"));
        assert_eq!(next.file_text("/a/f.txt").unwrap(), Bytes::from_static(b"two"));
        assert_eq!(base.node("/a").unwrap().created_rev, 1);
        assert_eq!(next.node("/a").unwrap().created_rev, 2);
        assert_eq!(next.root().created_rev, 2);
        assert!(base.node("/a").unwrap().related(next.node("/a").unwrap()));
        assert!(!base.node("/a").unwrap().same_version(next.node("/a").unwrap()));
    }

    #[test]
    fn test_stamp_skips_untouched_subtrees() {
        let mut tree = Tree::empty(0);
        tree.add_entry("/", "x", Arc::new(NodeRev::new_dir())).unwrap();
        tree.add_entry("/", "y", Arc::new(NodeRev::new_dir())).unwrap();
        tree.stamp(1);
        tree.node_mut("/x").unwrap().props.set("p", "v");
        tree.stamp(2);
        assert_eq!(tree.node("/x").unwrap().created_rev, 2);
        assert_eq!(tree.node("/y").unwrap().created_rev, 1);
    }

    #[test]
    fn test_add_existing_and_missing_parent() {
        let mut tree = Tree::empty(0);
        tree.add_entry("/", "a", file("x")).unwrap();
        assert!(matches!(
            tree.add_entry("/", "a", file("y")),
            Err(ReposError::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.add_entry("/a", "b", file("y")),
            Err(ReposError::NotADirectory(_))
        ));
        assert!(tree.add_entry("/missing", "b", file("y")).is_err());
        assert!(tree.remove("/").is_err());
        assert!(tree.remove("/nope").is_err());
    }

    #[test]
    fn test_flatten() {
        let mut tree = Tree::empty(0);
        tree.add_entry("/", "d", Arc::new(NodeRev::new_dir())).unwrap();
        tree.add_entry("/d", "f", file("data")).unwrap();
        let flat = tree.flatten();
        assert_eq!(flat.keys().cloned().collect::<Vec<_>>(), vec!["/", "/d", "/d/f"]);
        assert_eq!(flat["/d/f"].text, Some(Bytes::from_static(b"data")));
        assert_eq!(flat["/d"].kind, NodeKind::Dir);
    }

    #[test]
    fn test_fold_change_rules() {
        let mut changes = BTreeMap::new();
        fold_change(&mut changes, ChangedPath::new("/a", NodeAction::Add, NodeKind::Dir)).unwrap();
        fold_change(&mut changes, ChangedPath::new("/a/f", NodeAction::Add, NodeKind::File)).unwrap();
        let mut m = ChangedPath::new("/a/f", NodeAction::Modify, NodeKind::File);
        m.text_mod = true;
        fold_change(&mut changes, m).unwrap();
        assert_eq!(changes["/a/f"].action, NodeAction::Add);
        assert!(changes["/a/f"].text_mod);

        // Deleting the added directory drops everything beneath it.
        fold_change(&mut changes, ChangedPath::new("/a", NodeAction::Delete, NodeKind::Dir)).unwrap();
        assert!(changes.is_empty());

        fold_change(&mut changes, ChangedPath::new("/b", NodeAction::Delete, NodeKind::File)).unwrap();
        fold_change(&mut changes, ChangedPath::new("/b", NodeAction::Add, NodeKind::Dir)).unwrap();
        assert_eq!(changes["/b"].action, NodeAction::Replace);
        assert_eq!(changes["/b"].kind, NodeKind::Dir);

        assert!(fold_change(&mut changes, ChangedPath::new("/b", NodeAction::Add, NodeKind::Dir)).is_err());
    }
}
