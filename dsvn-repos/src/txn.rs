//! Transactions and the commit editor
//!
//! A [`Transaction`] is a mutable copy of its base revision's tree plus the
//! folded list of changes made to it. It can be edited directly or through
//! a [`CommitEditor`], and is published with `Repository::commit`.

use crate::authz::{Access, AccessCheck};
use crate::delta::{DeltaWindow, TextDelta, apply_delta, apply_window};
use crate::editor::{BatonId, BatonStack, DirBaton, Editor, FileBaton};
use crate::error::{ReposError, Result};
use crate::hooks::TxnInfo;
use crate::path;
use crate::props::{PropertySet, svn_props};
use crate::storage::Storage;
use crate::tree::{ChangedPath, NodeRev, Tree, fold_change};
use crate::types::{CopyFrom, NodeAction, NodeKind, Revnum, sha1_hex};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Names of the transactions open on a repository
pub(crate) type TxnRegistry = Arc<Mutex<BTreeSet<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Can be committed
    Commit,
    /// Scratch space for update reports; never committed
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Closed,
}

/// A mutable staging area on top of a base revision
pub struct Transaction {
    name: String,
    kind: TxnKind,
    base_rev: Revnum,
    root: Tree,
    props: PropertySet,
    changes: BTreeMap<String, ChangedPath>,
    lock_tokens: HashMap<String, String>,
    state: TxnState,
    storage: Arc<dyn Storage>,
    registry: TxnRegistry,
}

impl Transaction {
    pub(crate) fn begin(
        storage: Arc<dyn Storage>,
        registry: TxnRegistry,
        kind: TxnKind,
        base_rev: Revnum,
        root: Tree,
    ) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", base_rev, &suffix[..8]);
        registry
            .lock()
            .map_err(|_| ReposError::Storage("transaction registry poisoned".to_string()))?
            .insert(name.clone());
        tracing::debug!("Began transaction {} on r{}", name, base_rev);
        Ok(Self {
            name,
            kind,
            base_rev,
            root,
            props: PropertySet::new(),
            changes: BTreeMap::new(),
            lock_tokens: HashMap::new(),
            state: TxnState::Open,
            storage,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    pub fn base_rev(&self) -> Revnum {
        self.base_rev
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }

    /// The transaction's tree as edited so far
    pub fn root(&self) -> &Tree {
        &self.root
    }

    pub fn props(&self) -> &PropertySet {
        &self.props
    }

    /// Folded changes, sorted parents first
    pub fn changes(&self) -> Vec<ChangedPath> {
        let mut changes: Vec<ChangedPath> = self.changes.values().cloned().collect();
        changes.sort_by(|a, b| path::compare(&a.path, &b.path));
        changes
    }

    pub(crate) fn lock_tokens(&self) -> &HashMap<String, String> {
        &self.lock_tokens
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state == TxnState::Open {
            Ok(())
        } else {
            Err(ReposError::TxnNotFound(self.name.clone()))
        }
    }

    /// Close the transaction and forget its name.
    pub(crate) fn close(&mut self) {
        self.state = TxnState::Closed;
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.name);
        }
    }

    /// Discard the transaction.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.close();
        tracing::debug!("Aborted transaction {}", self.name);
        Ok(())
    }

    pub fn info(&self) -> TxnInfo {
        TxnInfo {
            name: self.name.clone(),
            base_rev: self.base_rev,
            author: self.props.get(svn_props::REVISION_AUTHOR).cloned(),
            log: self.props.get(svn_props::REVISION_LOG).cloned(),
            changes: self.changes(),
        }
    }

    pub fn change_txn_prop(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.props.apply(name, value);
        Ok(())
    }

    /// Present the token of a lock held on `path`.
    pub fn add_lock_token(&mut self, path: &str, token: &str) {
        self.lock_tokens
            .insert(path::canonicalize(path), token.to_string());
    }

    fn record(&mut self, change: ChangedPath) -> Result<()> {
        fold_change(&mut self.changes, change)
    }

    fn split(at: &str) -> Result<(String, String)> {
        let at = path::canonicalize(at);
        let name = path::basename(&at).to_string();
        if !path::is_valid_entry_name(&name) {
            return Err(ReposError::protocol(format!("invalid path '{}'", at)));
        }
        Ok((path::dirname(&at).to_string(), name))
    }

    fn add_node(&mut self, at: &str, node: NodeRev, copy_from: Option<CopyFrom>) -> Result<String> {
        self.ensure_open()?;
        let (parent, name) = Self::split(at)?;
        let kind = node.kind();
        self.root.add_entry(&parent, &name, Arc::new(node))?;
        let full = path::join(&parent, &name);
        let mut change = ChangedPath::new(&full, NodeAction::Add, kind);
        change.copy_from = copy_from;
        self.record(change)?;
        Ok(full)
    }

    pub fn make_dir(&mut self, at: &str) -> Result<()> {
        self.add_node(at, NodeRev::new_dir(), None).map(|_| ())
    }

    pub fn make_file(&mut self, at: &str) -> Result<()> {
        self.add_node(at, NodeRev::new_file(), None).map(|_| ())
    }

    /// Copy `from` (a path in a published revision) to `to`.
    pub fn copy(&mut self, from: &CopyFrom, to: &str) -> Result<()> {
        self.ensure_open()?;
        let revision = self.storage.read_revision(from.rev)?;
        let source = revision
            .root
            .get(&from.path)
            .ok_or_else(|| ReposError::not_found(&from.path, format!("r{}", from.rev)))?;
        let node = NodeRev::copied_from(source, from.clone());
        self.add_node(to, node, Some(from.clone())).map(|_| ())
    }

    pub fn delete(&mut self, at: &str) -> Result<()> {
        self.ensure_open()?;
        let at = path::canonicalize(at);
        let removed = self.root.remove(&at)?;
        self.record(ChangedPath::new(&at, NodeAction::Delete, removed.kind()))
    }

    fn modified(&mut self, at: &str, kind: NodeKind, text: bool, props: bool) -> Result<()> {
        let mut change = ChangedPath::new(at, NodeAction::Modify, kind);
        change.text_mod = text;
        change.prop_mod = props;
        self.record(change)
    }

    pub fn set_contents(&mut self, at: &str, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let at = path::canonicalize(at);
        let node = self.root.node_mut(&at)?;
        node.set_text(data.into())
            .map_err(|_| ReposError::NotAFile(at.clone()))?;
        self.modified(&at, NodeKind::File, true, false)
    }

    /// Apply a delta to the current text of a file.
    pub fn apply_text(&mut self, at: &str, delta: &TextDelta) -> Result<()> {
        let base = self.root.file_text(&path::canonicalize(at))?;
        let text = apply_delta(&base, delta)?;
        self.set_contents(at, text)
    }

    pub fn change_node_prop(&mut self, at: &str, name: &str, value: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if svn_props::is_entry_property(name) {
            return Ok(());
        }
        let at = path::canonicalize(at);
        let node = self.root.node_mut(&at)?;
        node.props.apply(name, value);
        let kind = node.kind();
        self.modified(&at, kind, false, true)
    }

    /// Replace every property of a node.
    pub fn set_node_props(&mut self, at: &str, props: PropertySet) -> Result<()> {
        self.ensure_open()?;
        let at = path::canonicalize(at);
        let node = self.root.node_mut(&at)?;
        node.props = props;
        let kind = node.kind();
        self.modified(&at, kind, false, true)
    }

    /// Edit this transaction through the editor protocol.
    pub fn commit_editor<'a>(&'a mut self, check: AccessCheck<'a>) -> CommitEditor<'a> {
        CommitEditor {
            txn: self,
            check,
            base_path: "/".to_string(),
            stack: BatonStack::new(),
            dirs: HashMap::new(),
            dir_bases: HashMap::new(),
            files: HashMap::new(),
        }
    }
}

struct FileState {
    path: String,
    base: Bytes,
    out: Option<Vec<u8>>,
}

/// Editor that records its calls into a transaction
///
/// Every touched path needs write access and every copy source read
/// access; a denial aborts the transaction. `close_edit` only finishes the
/// edit; publishing is `Repository::commit`.
pub struct CommitEditor<'a> {
    txn: &'a mut Transaction,
    check: AccessCheck<'a>,
    base_path: String,
    stack: BatonStack,
    dirs: HashMap<BatonId, String>,
    /// Base revisions the driver reported for open directories
    dir_bases: HashMap<BatonId, Revnum>,
    files: HashMap<BatonId, FileState>,
}

impl<'a> CommitEditor<'a> {
    /// Root the edit at `base_path` instead of `/`.
    pub fn rooted_at(mut self, base_path: &str) -> Self {
        self.base_path = path::canonicalize(base_path);
        self
    }

    /// Node at a path relative to the edit root, as edited so far
    pub(crate) fn node_at(&self, rel: &str) -> Option<&Arc<NodeRev>> {
        self.txn.root.get(&path::join(&self.base_path, rel))
    }

    fn dir_path(&self, dir: &DirBaton) -> Result<String> {
        self.dirs
            .get(&dir.id())
            .cloned()
            .ok_or_else(|| ReposError::protocol("unknown directory baton"))
    }

    /// Fail on denial, aborting the transaction.
    fn require(&mut self, at: &str, access: Access) -> Result<()> {
        if let Err(e) = self.check.require(at, access) {
            tracing::warn!("Commit to {} denied: {}", at, e);
            self.txn.close();
            self.stack.abort();
            return Err(e);
        }
        Ok(())
    }

    fn check_base(&self, at: &str, base_revision: Option<Revnum>) -> Result<()> {
        let (Some(base), Some(node)) = (base_revision, self.txn.root.get(at)) else {
            return Ok(());
        };
        if !node.is_mutable() && node.created_rev > base {
            return Err(ReposError::OutOfDate {
                path: at.to_string(),
                base,
                changed: node.created_rev,
            });
        }
        Ok(())
    }

    /// A directory is out of date for a property change only when its own
    /// properties changed after `base`; edits beneath it do not count.
    fn check_dir_props_base(&self, at: &str, base: Revnum) -> Result<()> {
        let head = self.txn.base_rev();
        if base >= head {
            return Ok(());
        }
        let then = self.txn.storage.read_revision(base)?;
        let now = self.txn.storage.read_revision(head)?;
        match (then.root.get(at), now.root.get(at)) {
            (Some(old), Some(new)) if old.props == new.props => Ok(()),
            (None, None) => Ok(()),
            (_, new) => Err(ReposError::OutOfDate {
                path: at.to_string(),
                base,
                changed: new.map(|n| n.created_rev).unwrap_or(head),
            }),
        }
    }

    fn open_child(&self, parent: &DirBaton, name: &str, kind: NodeKind) -> Result<String> {
        let at = path::join(&self.dir_path(parent)?, name);
        match self.txn.root.kind(&at) {
            k if k == kind => Ok(at),
            NodeKind::None => Err(ReposError::not_found(&at, self.txn.name())),
            _ if kind == NodeKind::Dir => Err(ReposError::NotADirectory(at)),
            _ => Err(ReposError::NotAFile(at)),
        }
    }

    fn add_child(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>, kind: NodeKind) -> Result<String> {
        let at = path::join(&self.dir_path(parent)?, name);
        self.require(&at, Access::Write)?;
        if let Some(cf) = &copy_from {
            self.require(&cf.path, Access::Read)?;
        }
        match copy_from {
            Some(cf) => {
                let source_kind = self.txn.storage.read_revision(cf.rev)?.root.kind(&cf.path);
                if source_kind != kind && source_kind != NodeKind::None {
                    return Err(ReposError::protocol(format!(
                        "copy source {} is not a {}",
                        cf, kind
                    )));
                }
                self.txn.copy(&cf, &at)?;
            }
            None if kind == NodeKind::Dir => self.txn.make_dir(&at)?,
            None => self.txn.make_file(&at)?,
        }
        Ok(at)
    }
}

impl Editor for CommitEditor<'_> {
    fn set_target_revision(&mut self, _rev: Revnum) -> Result<()> {
        Ok(())
    }

    fn open_root(&mut self, base_revision: Option<Revnum>) -> Result<DirBaton> {
        self.txn.ensure_open()?;
        if self.txn.root.kind(&self.base_path) != NodeKind::Dir {
            return Err(ReposError::NotADirectory(self.base_path.clone()));
        }
        let root = self.stack.open_root()?;
        self.dirs.insert(root.id(), self.base_path.clone());
        if let Some(base) = base_revision {
            self.dir_bases.insert(root.id(), base);
        }
        Ok(root)
    }

    fn delete_entry(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<()> {
        self.stack.entry_path(parent, name)?;
        let at = path::join(&self.dir_path(parent)?, name);
        self.require(&at, Access::Write)?;
        self.check_base(&at, base_revision)?;
        self.txn.delete(&at)
    }

    fn add_directory(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<DirBaton> {
        self.stack.entry_path(parent, name)?;
        let at = self.add_child(parent, name, copy_from, NodeKind::Dir)?;
        let dir = self.stack.push_dir(parent, name)?;
        self.dirs.insert(dir.id(), at);
        Ok(dir)
    }

    fn open_directory(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<DirBaton> {
        self.stack.entry_path(parent, name)?;
        let at = self.open_child(parent, name, NodeKind::Dir)?;
        let dir = self.stack.push_dir(parent, name)?;
        self.dirs.insert(dir.id(), at);
        if let Some(base) = base_revision {
            self.dir_bases.insert(dir.id(), base);
        }
        Ok(dir)
    }

    fn change_dir_prop(&mut self, dir: &DirBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_dir(dir)?;
        let at = self.dir_path(dir)?;
        self.require(&at, Access::Write)?;
        if let Some(base) = self.dir_bases.get(&dir.id()) {
            self.check_dir_props_base(&at, *base)?;
        }
        self.txn.change_node_prop(&at, name, value)
    }

    fn close_directory(&mut self, dir: DirBaton) -> Result<()> {
        let id = dir.id();
        self.stack.pop_dir(dir)?;
        self.dirs.remove(&id);
        self.dir_bases.remove(&id);
        Ok(())
    }

    fn add_file(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<FileBaton> {
        self.stack.entry_path(parent, name)?;
        let at = self.add_child(parent, name, copy_from, NodeKind::File)?;
        let file = self.stack.push_file(parent, name)?;
        self.files.insert(
            file.id(),
            FileState {
                path: at,
                base: Bytes::new(),
                out: None,
            },
        );
        Ok(file)
    }

    fn open_file(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<FileBaton> {
        self.stack.entry_path(parent, name)?;
        let at = self.open_child(parent, name, NodeKind::File)?;
        self.check_base(&at, base_revision)?;
        let file = self.stack.push_file(parent, name)?;
        self.files.insert(
            file.id(),
            FileState {
                path: at,
                base: Bytes::new(),
                out: None,
            },
        );
        Ok(file)
    }

    fn apply_text_delta(&mut self, file: &FileBaton, base_checksum: Option<&str>) -> Result<()> {
        self.stack.check_file(file)?;
        let at = self
            .files
            .get(&file.id())
            .map(|f| f.path.clone())
            .ok_or_else(|| ReposError::protocol("unknown file baton"))?;
        self.require(&at, Access::Write)?;
        let base = self.txn.root.file_text(&at)?;
        if let Some(expected) = base_checksum {
            let actual = sha1_hex(&base);
            if actual != expected {
                return Err(ReposError::ChecksumMismatch {
                    path: at,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        self.stack.begin_delta(file)?;
        if let Some(state) = self.files.get_mut(&file.id()) {
            state.base = base;
            state.out = Some(Vec::new());
        }
        Ok(())
    }

    fn text_delta_window(&mut self, file: &FileBaton, window: Option<&DeltaWindow>) -> Result<()> {
        self.stack.delta_window(file, window.is_none())?;
        let state = self
            .files
            .get_mut(&file.id())
            .ok_or_else(|| ReposError::protocol("unknown file baton"))?;
        match window {
            Some(w) => {
                let out = state.out.get_or_insert_with(Vec::new);
                let offset = out.len() as u64;
                apply_window(&state.base, w, offset, out)
            }
            None => {
                let text = state.out.take().unwrap_or_default();
                let at = state.path.clone();
                self.txn.set_contents(&at, text)
            }
        }
    }

    fn change_file_prop(&mut self, file: &FileBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_file(file)?;
        let at = self
            .files
            .get(&file.id())
            .map(|f| f.path.clone())
            .ok_or_else(|| ReposError::protocol("unknown file baton"))?;
        self.require(&at, Access::Write)?;
        self.txn.change_node_prop(&at, name, value)
    }

    fn close_file(&mut self, file: FileBaton, text_checksum: Option<&str>) -> Result<()> {
        let id = file.id();
        self.stack.pop_file(file)?;
        let state = self
            .files
            .remove(&id)
            .ok_or_else(|| ReposError::protocol("unknown file baton"))?;
        if let Some(expected) = text_checksum {
            let actual = sha1_hex(&self.txn.root.file_text(&state.path)?);
            if actual != expected {
                return Err(ReposError::ChecksumMismatch {
                    path: state.path,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn close_edit(&mut self) -> Result<()> {
        self.stack.close_edit()
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.stack.abort();
        if self.txn.is_open() {
            self.txn.abort()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::delta::compute_delta;
    use crate::editor::send_text_delta;
    use crate::storage::MemoryStore;

    fn txn() -> Transaction {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let root = storage.read_revision(0).unwrap().root.clone();
        Transaction::begin(storage, TxnRegistry::default(), TxnKind::Commit, 0, root).unwrap()
    }

    #[test]
    fn test_direct_edits_are_folded() {
        let mut t = txn();
        t.make_dir("/trunk").unwrap();
        t.make_file("/trunk/a.txt").unwrap();
        t.set_contents("/trunk/a.txt", "hello").unwrap();
        t.change_node_prop("/trunk/a.txt", "svn:eol-style", Some("native")).unwrap();
        t.make_file("/tmp.txt").unwrap();
        t.delete("/tmp.txt").unwrap();

        let changes = t.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, "/trunk");
        assert_eq!(changes[1].action, NodeAction::Add);
        assert!(changes[1].text_mod && changes[1].prop_mod);
        assert_eq!(t.root().file_text("/trunk/a.txt").unwrap(), Bytes::from_static(b"hello"));
        assert!(t.make_dir("/trunk").is_err());
    }

    #[test]
    fn test_apply_text() {
        let mut t = txn();
        t.make_file("/f").unwrap();
        t.set_contents("/f", "one two three").unwrap();
        let delta = compute_delta(b"one two three", b"one 2 three");
        t.apply_text("/f", &delta).unwrap();
        assert_eq!(t.root().file_text("/f").unwrap(), Bytes::from_static(b"one 2 three"));
    }

    #[test]
    fn test_abort_twice_fails() {
        let mut t = txn();
        t.abort().unwrap();
        assert!(matches!(t.abort(), Err(ReposError::TxnNotFound(_))));
        assert!(matches!(t.make_dir("/x"), Err(ReposError::TxnNotFound(_))));
    }

    #[test]
    fn test_commit_editor_builds_tree() {
        let mut t = txn();
        {
            let mut ed = t.commit_editor(AccessCheck::new(&AllowAll, "r", Some("alice")));
            let root = ed.open_root(None).unwrap();
            let dir = ed.add_directory(&root, "src", None).unwrap();
            ed.change_dir_prop(&dir, "svn:ignore", Some("target")).unwrap();
            let file = ed.add_file(&dir, "lib.rs", None).unwrap();
            send_text_delta(&mut ed, &file, Some(b""), b"pub fn f() {}\n", true).unwrap();
            let checksum = sha1_hex(b"pub fn f() {}\n");
            ed.close_file(file, Some(&checksum)).unwrap();
            ed.close_directory(dir).unwrap();
            ed.close_directory(root).unwrap();
            ed.close_edit().unwrap();
        }
        assert_eq!(
            t.root().file_text("/src/lib.rs").unwrap(),
            Bytes::from_static(b"pub fn f() {}\n")
        );
        assert_eq!(t.root().node("/src").unwrap().props.get("svn:ignore").unwrap(), "target");
        assert!(t.is_open());
    }

    #[test]
    fn test_commit_editor_checksum_mismatch() {
        let mut t = txn();
        let mut ed = t.commit_editor(AccessCheck::new(&AllowAll, "r", None));
        let root = ed.open_root(None).unwrap();
        let file = ed.add_file(&root, "f", None).unwrap();
        send_text_delta(&mut ed, &file, None, b"data", true).unwrap();
        let err = ed.close_file(file, Some("0000")).unwrap_err();
        assert!(matches!(err, ReposError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_commit_editor_denial_aborts() {
        let mut t = txn();
        let deny = |_: &str, p: &str, _: Option<&str>, a: Access| !(a == Access::Write && p.starts_with("/secret"));
        {
            let mut ed = t.commit_editor(AccessCheck::new(&deny, "r", None));
            let root = ed.open_root(None).unwrap();
            let err = ed.add_directory(&root, "secret", None).unwrap_err();
            assert!(err.is_access_denied());
        }
        assert!(!t.is_open());
    }

    #[test]
    fn test_commit_editor_copy_kind_mismatch_leaves_txn_untouched() {
        let mut t = txn();
        t.make_dir("/keep").unwrap();
        let before = t.changes();
        {
            let mut ed = t.commit_editor(AccessCheck::new(&AllowAll, "r", None));
            let root = ed.open_root(None).unwrap();
            let err = ed.add_file(&root, "f", Some(CopyFrom::new("/", 0))).unwrap_err();
            assert!(matches!(err, ReposError::ProtocolViolation(_)));
        }
        assert_eq!(t.changes(), before);
        assert_eq!(t.root().kind("/f"), NodeKind::None);
    }

    #[test]
    fn test_commit_editor_missing_entries() {
        let mut t = txn();
        let mut ed = t.commit_editor(AccessCheck::new(&AllowAll, "r", None));
        let root = ed.open_root(None).unwrap();
        assert!(matches!(ed.open_file(&root, "nope", None), Err(ReposError::NotFound { .. })));
        assert!(ed.delete_entry(&root, "nope", None).is_err());
        ed.abort_edit().unwrap();
        drop(ed);
        assert!(!t.is_open());
    }
}
