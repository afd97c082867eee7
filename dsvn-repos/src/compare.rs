//! Tree comparison
//!
//! [`TreeDelta`] drives an editor with the changes that turn a source shape
//! into a target tree. The source shape starts from one revision of one path
//! and is refined by report entries: a subtree can sit at another revision,
//! be linked to another path, start empty, or be missing.
//!
//! Unchanged subtrees (same node, same version, nothing reported beneath
//! them) are skipped without being read. Paths the user may not read are
//! never named in any editor call.

use crate::authz::AccessCheck;
use crate::editor::{DirBaton, Editor, FileBaton, send_text_delta};
use crate::error::{ReposError, Result};
use crate::path;
use crate::props::{PropertySet, svn_props};
use crate::storage::{Revision, Storage};
use crate::tree::{NodeRev, Tree};
use crate::types::{CancelFn, Revnum, check_cancel, sha1_hex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// What the client said about one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathInfo {
    Deleted,
    Present {
        rev: Revnum,
        link: Option<String>,
        start_empty: bool,
        lock_token: Option<String>,
    },
}

/// Report entries keyed by path relative to the report target
pub(crate) type ReportMap = BTreeMap<String, PathInfo>;

/// Where one node of the source shape comes from
#[derive(Debug, Clone)]
struct Source {
    rev: Revnum,
    path: String,
    node: Option<Arc<NodeRev>>,
    start_empty: bool,
    lock_token: Option<String>,
}

pub(crate) struct TreeDelta<'a> {
    storage: &'a dyn Storage,
    target: &'a Tree,
    report: &'a ReportMap,
    check: AccessCheck<'a>,
    cancel: CancelFn<'a>,
    text_deltas: bool,
    ignore_ancestry: bool,
    revisions: HashMap<Revnum, Arc<Revision>>,
}

impl<'a> TreeDelta<'a> {
    pub(crate) fn new(
        storage: &'a dyn Storage,
        target: &'a Tree,
        report: &'a ReportMap,
        check: AccessCheck<'a>,
        cancel: CancelFn<'a>,
    ) -> Self {
        Self {
            storage,
            target,
            report,
            check,
            cancel,
            text_deltas: true,
            ignore_ancestry: false,
            revisions: HashMap::new(),
        }
    }

    pub(crate) fn text_deltas(mut self, on: bool) -> Self {
        self.text_deltas = on;
        self
    }

    pub(crate) fn ignore_ancestry(mut self, on: bool) -> Self {
        self.ignore_ancestry = on;
        self
    }

    /// Drive a complete edit.
    ///
    /// `anchor` is the source directory the edit is rooted at and `target` an
    /// optional entry name beneath it; `t_path` is the path in the target
    /// tree that corresponds to `anchor/target`.
    pub(crate) fn drive(
        &mut self,
        editor: &mut dyn Editor,
        target_rev: Revnum,
        anchor: &str,
        target: &str,
        t_path: &str,
    ) -> Result<()> {
        let (rev, link, start_empty, lock_token) = match self.report.get("") {
            Some(PathInfo::Present {
                rev,
                link,
                start_empty,
                lock_token,
            }) => (*rev, link.clone(), *start_empty, lock_token.clone()),
            Some(PathInfo::Deleted) => return Err(ReposError::protocol("the report root cannot be deleted")),
            None => return Err(ReposError::protocol("report has no root entry")),
        };
        let s_path = link.unwrap_or_else(|| path::join(anchor, target));
        let source = Source {
            node: self.source_node(rev, &s_path)?,
            rev,
            path: s_path,
            start_empty,
            lock_token,
        };

        editor.set_target_revision(target_rev)?;
        let root = editor.open_root(Some(rev))?;
        if target.is_empty() {
            let t_node = self.target.node(t_path)?.clone();
            if !t_node.is_dir() {
                return Err(ReposError::NotADirectory(t_path.to_string()));
            }
            if self.check.can_read(t_path) {
                self.delta_dirs(editor, &root, &source, &t_node, t_path, "")?;
            }
        } else {
            let t_node = self.target.get(t_path).cloned();
            self.update_entry(editor, &root, target, source, t_node, t_path, target)?;
        }
        editor.close_directory(root)?;
        editor.close_edit()
    }

    fn source_node(&mut self, rev: Revnum, at: &str) -> Result<Option<Arc<NodeRev>>> {
        let revision = match self.revisions.get(&rev) {
            Some(r) => r.clone(),
            None => {
                let r = self.storage.read_revision(rev)?;
                self.revisions.insert(rev, r.clone());
                r
            }
        };
        Ok(revision.root.get(at).cloned())
    }

    /// Source of the entry `name` of a directory whose source is `parent`.
    fn child_source(&mut self, parent: &Source, name: &str, e_child: &str) -> Result<Source> {
        let report = self.report;
        let default_path = path::join(&parent.path, name);
        match report.get(e_child) {
            Some(PathInfo::Deleted) => Ok(Source {
                rev: parent.rev,
                path: default_path,
                node: None,
                start_empty: false,
                lock_token: None,
            }),
            Some(PathInfo::Present {
                rev,
                link,
                start_empty,
                lock_token,
            }) => {
                let s_path = link.clone().unwrap_or(default_path);
                Ok(Source {
                    node: self.source_node(*rev, &s_path)?,
                    rev: *rev,
                    path: s_path,
                    start_empty: *start_empty,
                    lock_token: lock_token.clone(),
                })
            }
            None => {
                let node = if parent.start_empty {
                    None
                } else {
                    parent
                        .node
                        .as_ref()
                        .and_then(|n| n.entries())
                        .and_then(|entries| entries.get(name))
                        .cloned()
                };
                Ok(Source {
                    rev: parent.rev,
                    path: default_path,
                    node,
                    start_empty: false,
                    lock_token: None,
                })
            }
        }
    }

    fn report_prefix(e_path: &str) -> String {
        if e_path.is_empty() {
            String::new()
        } else {
            format!("{}/", e_path)
        }
    }

    /// Names of the immediate children of `e_path` that have report entries.
    fn reported_children(&self, e_path: &str) -> BTreeSet<String> {
        let prefix = Self::report_prefix(e_path);
        self.report
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn has_report_below(&self, e_path: &str) -> bool {
        let prefix = Self::report_prefix(e_path);
        self.report
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k.len() > prefix.len())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_entry(
        &mut self,
        editor: &mut dyn Editor,
        parent: &DirBaton,
        name: &str,
        source: Source,
        t_node: Option<Arc<NodeRev>>,
        t_path: &str,
        e_path: &str,
    ) -> Result<()> {
        check_cancel(self.cancel)?;
        if !self.check.can_read(t_path) {
            return Ok(());
        }

        let t_node = match (t_node, &source.node) {
            (None, None) => return Ok(()),
            (None, Some(_)) => return editor.delete_entry(parent, name, Some(source.rev)),
            (Some(t), _) => t,
        };

        let related = source.node.as_ref().is_some_and(|s| {
            s.kind() == t_node.kind() && (self.ignore_ancestry || s.related(&t_node))
        });

        if related {
            let unchanged = source.node.as_ref().is_some_and(|s| s.same_version(&t_node))
                && !source.start_empty
                && source.lock_token.is_none()
                && !self.has_report_below(e_path);
            if unchanged {
                return Ok(());
            }
            if t_node.is_dir() {
                let dir = editor.open_directory(parent, name, Some(source.rev))?;
                self.delta_dirs(editor, &dir, &source, &t_node, t_path, e_path)?;
                editor.close_directory(dir)
            } else {
                let file = editor.open_file(parent, name, Some(source.rev))?;
                self.delta_files(editor, &file, &source, &t_node, t_path)?;
                editor.close_file(file, t_node.text().map(|t| sha1_hex(t)).as_deref())
            }
        } else {
            if source.node.is_some() {
                editor.delete_entry(parent, name, Some(source.rev))?;
            }
            let added = Source {
                node: None,
                start_empty: false,
                lock_token: None,
                ..source
            };
            if t_node.is_dir() {
                let dir = editor.add_directory(parent, name, None)?;
                self.delta_dirs(editor, &dir, &added, &t_node, t_path, e_path)?;
                editor.close_directory(dir)
            } else {
                let file = editor.add_file(parent, name, None)?;
                self.delta_files(editor, &file, &added, &t_node, t_path)?;
                editor.close_file(file, t_node.text().map(|t| sha1_hex(t)).as_deref())
            }
        }
    }

    fn delta_dirs(
        &mut self,
        editor: &mut dyn Editor,
        dir: &DirBaton,
        source: &Source,
        t_node: &NodeRev,
        t_path: &str,
        e_path: &str,
    ) -> Result<()> {
        let empty = PropertySet::new();
        let s_props = source.node.as_ref().map(|n| &n.props).unwrap_or(&empty);
        for change in s_props.diff(&t_node.props) {
            editor.change_dir_prop(dir, &change.name, change.value.as_deref())?;
        }

        let no_entries = BTreeMap::new();
        let t_entries = t_node.entries().unwrap_or(&no_entries);
        let mut names: BTreeSet<String> = self.reported_children(e_path);
        if !source.start_empty {
            if let Some(entries) = source.node.as_ref().and_then(|n| n.entries()) {
                names.extend(entries.keys().cloned());
            }
        }

        // Deletions first, so a replaced name is deleted before it is added.
        for name in names.iter().filter(|n| !t_entries.contains_key(*n)) {
            let e_child = path::join(e_path, name);
            let child = self.child_source(source, name, &e_child)?;
            self.update_entry(editor, dir, name, child, None, &path::join(t_path, name), &e_child)?;
        }

        for (name, t_child) in t_entries {
            let e_child = path::join(e_path, name);
            let child = self.child_source(source, name, &e_child)?;
            self.update_entry(
                editor,
                dir,
                name,
                child,
                Some(t_child.clone()),
                &path::join(t_path, name),
                &e_child,
            )?;
        }
        Ok(())
    }

    fn delta_files(
        &mut self,
        editor: &mut dyn Editor,
        file: &FileBaton,
        source: &Source,
        t_node: &NodeRev,
        t_path: &str,
    ) -> Result<()> {
        let empty = PropertySet::new();
        let s_props = source.node.as_ref().map(|n| &n.props).unwrap_or(&empty);
        for change in s_props.diff(&t_node.props) {
            editor.change_file_prop(file, &change.name, change.value.as_deref())?;
        }

        let text_changed = match &source.node {
            Some(s) => s.text_id() != t_node.text_id(),
            None => true,
        };
        if text_changed {
            let target = t_node.text().map(|t| t.as_ref()).unwrap_or(&[]);
            let base = source.node.as_ref().and_then(|s| s.text()).map(|t| t.as_ref());
            send_text_delta(editor, file, base, target, self.text_deltas)?;
        }

        if let Some(token) = &source.lock_token {
            let held = self
                .storage
                .get_lock(t_path)?
                .is_some_and(|lock| &lock.token == token);
            if !held {
                editor.change_file_prop(file, svn_props::ENTRY_LOCK_TOKEN, None)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Access, AllowAll};
    use crate::editor::EditRecorder;
    use crate::props::PropertySet;
    use crate::storage::MemoryStore;
    use crate::tree::ChangedPath;
    use crate::types::never_cancel;
    use bytes::Bytes;

    /// r1: /a.txt, /d/b.txt ; r2: /a.txt changed
    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tree = store.read_revision(0).unwrap().root.clone();
        let mut a = NodeRev::new_file();
        a.set_text(Bytes::from_static(b"alpha\n")).unwrap();
        tree.add_entry("/", "a.txt", Arc::new(a)).unwrap();
        tree.add_entry("/", "d", Arc::new(NodeRev::new_dir())).unwrap();
        let mut b = NodeRev::new_file();
        b.set_text(Bytes::from_static(b"beta\n")).unwrap();
        tree.add_entry("/d", "b.txt", Arc::new(b)).unwrap();
        publish(&store, tree.clone());

        tree.node_mut("/a.txt").unwrap().set_text(Bytes::from_static(b"alpha two\n")).unwrap();
        publish(&store, tree);
        store
    }

    fn publish(store: &MemoryStore, mut tree: Tree) {
        let rev = store.allocate_next_revision().unwrap();
        tree.stamp(rev);
        store
            .write_revision(Revision {
                rev,
                root: tree,
                props: PropertySet::new(),
                changes: Vec::<ChangedPath>::new(),
            })
            .unwrap();
    }

    fn run(store: &MemoryStore, report: &ReportMap, rev: Revnum) -> EditRecorder {
        let target = store.read_revision(rev).unwrap();
        let mut recorder = EditRecorder::new();
        TreeDelta::new(store, &target.root, report, AccessCheck::new(&AllowAll, "r", None), &never_cancel)
            .drive(&mut recorder, rev, "/", "", "/")
            .unwrap();
        recorder
    }

    fn root_at(rev: Revnum, start_empty: bool) -> ReportMap {
        let mut report = ReportMap::new();
        report.insert(
            "".into(),
            PathInfo::Present {
                rev,
                link: None,
                start_empty,
                lock_token: None,
            },
        );
        report
    }

    #[test]
    fn test_only_changed_file_is_touched() {
        let store = store();
        let rec = run(&store, &root_at(1, false), 2);
        assert_eq!(
            rec.calls,
            vec![
                "open_root",
                "open_file a.txt",
                "apply_text_delta a.txt",
                "close_file a.txt",
                "close_directory ",
                "close_edit"
            ]
        );
    }

    #[test]
    fn test_start_empty_adds_everything() {
        let store = store();
        let rec = run(&store, &root_at(2, true), 2);
        assert!(rec.calls.contains(&"add_file a.txt".to_string()));
        assert!(rec.calls.contains(&"add_directory d".to_string()));
        assert!(rec.calls.contains(&"add_file d/b.txt".to_string()));
    }

    #[test]
    fn test_deleted_entry_is_re_added() {
        let store = store();
        let mut report = root_at(2, false);
        report.insert("d/b.txt".into(), PathInfo::Deleted);
        let rec = run(&store, &report, 2);
        assert_eq!(
            rec.calls,
            vec![
                "open_root",
                "open_directory d",
                "add_file d/b.txt",
                "apply_text_delta d/b.txt",
                "close_file d/b.txt",
                "close_directory d",
                "close_directory ",
                "close_edit"
            ]
        );
    }

    #[test]
    fn test_unreadable_paths_are_never_named() {
        let store = store();
        let deny_d = |_: &str, p: &str, _: Option<&str>, _: Access| !path::is_ancestor("/d", p);
        let target = store.read_revision(2).unwrap();
        let report = root_at(0, false);
        let mut rec = EditRecorder::new();
        TreeDelta::new(&store, &target.root, &report, AccessCheck::new(&deny_d, "r", None), &never_cancel)
            .drive(&mut rec, 2, "/", "", "/")
            .unwrap();
        assert!(rec.touched_paths().iter().all(|p| !p.starts_with('d')));
        assert!(rec.calls.contains(&"add_file a.txt".to_string()));
    }

    #[test]
    fn test_missing_root_entry() {
        let store = store();
        let target = store.read_revision(2).unwrap();
        let report = ReportMap::new();
        let mut rec = EditRecorder::new();
        let err = TreeDelta::new(&store, &target.root, &report, AccessCheck::new(&AllowAll, "r", None), &never_cancel)
            .drive(&mut rec, 2, "/", "", "/")
            .unwrap_err();
        assert!(matches!(err, ReposError::ProtocolViolation(_)));
    }

    #[test]
    fn test_cancel_stops_the_drive() {
        let store = store();
        let target = store.read_revision(2).unwrap();
        let report = root_at(0, false);
        let mut rec = EditRecorder::new();
        let cancel = || true;
        let err = TreeDelta::new(&store, &target.root, &report, AccessCheck::new(&AllowAll, "r", None), &cancel)
            .drive(&mut rec, 2, "/", "", "/")
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
