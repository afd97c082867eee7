//! Revision replay
//!
//! Drives an editor with the changes a revision made to its predecessor,
//! working from the revision's changed paths. Copies are sent as
//! `add_*` with a copy source and a delta against that source, unless the
//! source revision is below the low-water mark, in which case the copied
//! subtree is sent in full without history.

use crate::authz::{AccessCheck, Authz};
use crate::editor::{DirBaton, Editor, FileBaton, send_text_delta};
use crate::error::{ReposError, Result};
use crate::path;
use crate::props::PropertySet;
use crate::repos::Repository;
use crate::storage::{Revision, Storage};
use crate::tree::{ChangedPath, NodeRev};
use crate::types::{CancelFn, NodeAction, Revnum, check_cancel, sha1_hex};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Only changes at or below this path are sent; editor paths are
    /// relative to it
    pub base_path: String,
    /// Copies from revisions older than this are sent as plain adds
    pub low_water_mark: Revnum,
    pub send_deltas: bool,
    pub user: Option<String>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            base_path: "/".to_string(),
            low_water_mark: 0,
            send_deltas: true,
            user: None,
        }
    }
}

impl Repository {
    /// Drive `editor` with the changes made in `rev`.
    pub fn replay(
        &self,
        rev: Revnum,
        editor: &mut dyn Editor,
        options: &ReplayOptions,
        authz: &dyn Authz,
        cancel: CancelFn<'_>,
    ) -> Result<()> {
        let revision = self.revision(rev)?;
        let check = AccessCheck::new(authz, self.name(), options.user.as_deref());
        let replay = Replay {
            storage: self.storage().as_ref(),
            check,
            cancel,
            low_water_mark: options.low_water_mark,
            send_deltas: options.send_deltas,
        };
        let result = replay.drive(editor, &revision, &path::canonicalize(&options.base_path));
        if result.is_err() {
            if let Err(e) = editor.abort_edit() {
                tracing::debug!("abort_edit after failed replay of r{}: {}", rev, e);
            }
        }
        result
    }
}

/// Keeps the directories leading to the current path open, opening and
/// closing them as the driven paths move through the tree.
pub(crate) struct PathDriver {
    base_revision: Option<Revnum>,
    stack: Vec<(String, DirBaton)>,
}

impl PathDriver {
    /// Open the edit root.
    pub(crate) fn start(editor: &mut dyn Editor, base_revision: Option<Revnum>) -> Result<Self> {
        let root = editor.open_root(base_revision)?;
        Ok(Self {
            base_revision,
            stack: vec![(String::new(), root)],
        })
    }

    /// Make the directory at relative path `at` the innermost open one.
    pub(crate) fn open_dir(&mut self, editor: &mut dyn Editor, at: &str) -> Result<&DirBaton> {
        while self.stack.len() > 1 {
            let top = &self.stack[self.stack.len() - 1].0;
            if path::skip_ancestor(top, at).is_some() {
                break;
            }
            if let Some((_, dir)) = self.stack.pop() {
                editor.close_directory(dir)?;
            }
        }
        let (mut current, rest) = match self.stack.last() {
            Some((top, _)) => (top.clone(), path::skip_ancestor(top, at).unwrap_or_default().to_string()),
            None => return Err(ReposError::protocol("path driver already finished")),
        };
        for name in path::components(&rest) {
            current = path::join(&current, name);
            let dir = match self.stack.last() {
                Some((_, parent)) => editor.open_directory(parent, name, self.base_revision)?,
                None => return Err(ReposError::protocol("path driver already finished")),
            };
            self.stack.push((current.clone(), dir));
        }
        self.top()
    }

    pub(crate) fn top(&self) -> Result<&DirBaton> {
        self.stack
            .last()
            .map(|(_, dir)| dir)
            .ok_or_else(|| ReposError::protocol("path driver already finished"))
    }

    /// Record a directory the caller just added or opened beneath the top.
    pub(crate) fn push(&mut self, at: String, dir: DirBaton) {
        self.stack.push((at, dir));
    }

    /// Close every open directory and the edit.
    pub(crate) fn finish(mut self, editor: &mut dyn Editor) -> Result<()> {
        while let Some((_, dir)) = self.stack.pop() {
            editor.close_directory(dir)?;
        }
        editor.close_edit()
    }
}

pub(crate) struct Replay<'a> {
    pub(crate) storage: &'a dyn Storage,
    pub(crate) check: AccessCheck<'a>,
    pub(crate) cancel: CancelFn<'a>,
    pub(crate) low_water_mark: Revnum,
    pub(crate) send_deltas: bool,
}

impl Replay<'_> {
    pub(crate) fn drive(&self, editor: &mut dyn Editor, revision: &Revision, base_path: &str) -> Result<()> {
        let rev = revision.rev;
        let prev = match rev.checked_sub(1) {
            Some(p) => Some(self.storage.read_revision(p)?),
            None => None,
        };
        editor.set_target_revision(rev)?;
        let mut driver = PathDriver::start(editor, rev.checked_sub(1))?;
        let mut expanded: Vec<String> = Vec::new();

        for change in &revision.changes {
            check_cancel(self.cancel)?;
            let Some(rel) = path::skip_ancestor(base_path, &change.path) else {
                continue;
            };
            if !self.readable_chain(base_path, &change.path) {
                continue;
            }
            if expanded.iter().any(|e| path::is_ancestor(e, &change.path)) {
                continue;
            }
            let node = revision.root.get(&change.path);
            tracing::debug!("replay r{} {} {}", rev, change.action.code(), change.path);

            if rel.is_empty() {
                if let (NodeAction::Modify, Some(node)) = (change.action, node) {
                    if node.is_dir() {
                        let base = self.base_node(revision, prev.as_deref(), &change.path)?;
                        let dir = driver.open_dir(editor, "")?;
                        send_dir_props(editor, dir, base.as_deref(), node)?;
                    }
                }
                continue;
            }

            let parent_rel = path::dirname(rel);
            let name = path::basename(rel);
            match change.action {
                NodeAction::Delete => {
                    let parent = driver.open_dir(editor, parent_rel)?;
                    editor.delete_entry(parent, name, rev.checked_sub(1))?;
                }
                NodeAction::Add | NodeAction::Replace => {
                    let Some(node) = node else {
                        return Err(ReposError::not_found(&change.path, format!("r{}", rev)));
                    };
                    if change.action == NodeAction::Replace {
                        let parent = driver.open_dir(editor, parent_rel)?;
                        editor.delete_entry(parent, name, rev.checked_sub(1))?;
                    }
                    if self.add_node(editor, &mut driver, rel, change, node)? {
                        expanded.push(change.path.clone());
                    }
                }
                NodeAction::Modify => {
                    let Some(node) = node else {
                        return Err(ReposError::not_found(&change.path, format!("r{}", rev)));
                    };
                    let base = self.base_node(revision, prev.as_deref(), &change.path)?;
                    if node.is_dir() {
                        let dir = driver.open_dir(editor, rel)?;
                        send_dir_props(editor, dir, base.as_deref(), node)?;
                    } else {
                        let parent = driver.open_dir(editor, parent_rel)?;
                        let file = editor.open_file(parent, name, rev.checked_sub(1))?;
                        self.send_file(editor, &file, base.as_deref(), node)?;
                        editor.close_file(file, node.text().map(|t| sha1_hex(t)).as_deref())?;
                    }
                }
            }
        }
        driver.finish(editor)
    }

    /// True if `at` and every directory between it and `base_path` are
    /// readable.
    fn readable_chain(&self, base_path: &str, at: &str) -> bool {
        let mut current = at;
        loop {
            if !self.check.can_read(current) {
                return false;
            }
            if current == base_path || current == "/" {
                return true;
            }
            current = path::dirname(current);
        }
    }

    /// The node `at` was derived from: the same path in the previous
    /// revision, or the matching path under a directory copied in this one.
    fn base_node(&self, revision: &Revision, prev: Option<&Revision>, at: &str) -> Result<Option<Arc<NodeRev>>> {
        let copied_parent = revision
            .changes
            .iter()
            .filter(|c| c.copy_from.is_some() && c.path != at && path::is_ancestor(&c.path, at))
            .max_by_key(|c| c.path.len());
        if let Some(ChangedPath {
            path: copy_path,
            copy_from: Some(cf),
            ..
        }) = copied_parent
        {
            let rest = path::skip_ancestor(copy_path, at).unwrap_or_default();
            let source = self.storage.read_revision(cf.rev)?;
            return Ok(source.root.get(&path::join(&cf.path, rest)).cloned());
        }
        Ok(prev.and_then(|p| p.root.get(at).cloned()))
    }

    /// Send an added node. Returns true if a copy was expanded into a full
    /// add, so that changes beneath it are already covered.
    fn add_node(
        &self,
        editor: &mut dyn Editor,
        driver: &mut PathDriver,
        rel: &str,
        change: &ChangedPath,
        node: &NodeRev,
    ) -> Result<bool> {
        let name = path::basename(rel);
        let copy = change
            .copy_from
            .as_ref()
            .filter(|cf| cf.rev >= self.low_water_mark && self.check.can_read(&cf.path));
        let source = match copy {
            Some(cf) => self.storage.read_revision(cf.rev)?.root.get(&cf.path).cloned(),
            None => None,
        };
        let expand = change.copy_from.is_some() && copy.is_none();
        if expand {
            tracing::warn!(
                "Copy of {} from {} sent without history",
                change.path,
                change.copy_from.as_ref().map(|cf| cf.to_string()).unwrap_or_default()
            );
        }

        let parent = driver.open_dir(editor, path::dirname(rel))?;
        if node.is_dir() {
            let dir = editor.add_directory(parent, name, copy.cloned())?;
            send_dir_props(editor, &dir, source.as_deref(), node)?;
            if expand {
                self.add_tree(editor, &dir, node, &change.path)?;
            }
            driver.push(rel.to_string(), dir);
        } else {
            let file = editor.add_file(parent, name, copy.cloned())?;
            self.send_file(editor, &file, source.as_deref(), node)?;
            editor.close_file(file, node.text().map(|t| sha1_hex(t)).as_deref())?;
        }
        Ok(expand)
    }

    /// Add every readable entry of `node` beneath `dir`.
    fn add_tree(&self, editor: &mut dyn Editor, dir: &DirBaton, node: &NodeRev, at: &str) -> Result<()> {
        let Some(entries) = node.entries() else {
            return Ok(());
        };
        for (name, child) in entries {
            check_cancel(self.cancel)?;
            let child_path = path::join(at, name);
            if !self.check.can_read(&child_path) {
                continue;
            }
            if child.is_dir() {
                let sub = editor.add_directory(dir, name, None)?;
                send_dir_props(editor, &sub, None, child)?;
                self.add_tree(editor, &sub, child, &child_path)?;
                editor.close_directory(sub)?;
            } else {
                let file = editor.add_file(dir, name, None)?;
                self.send_file(editor, &file, None, child)?;
                editor.close_file(file, child.text().map(|t| sha1_hex(t)).as_deref())?;
            }
        }
        Ok(())
    }

    fn send_file(&self, editor: &mut dyn Editor, file: &FileBaton, base: Option<&NodeRev>, node: &NodeRev) -> Result<()> {
        let empty = PropertySet::new();
        for change in base.map(|b| &b.props).unwrap_or(&empty).diff(&node.props) {
            editor.change_file_prop(file, &change.name, change.value.as_deref())?;
        }
        let changed = match base {
            Some(b) => b.text_id() != node.text_id(),
            None => true,
        };
        if changed {
            let target = node.text().map(|t| t.as_ref()).unwrap_or(&[]);
            let base_text = base.and_then(|b| b.text()).map(|t| t.as_ref());
            send_text_delta(editor, file, base_text, target, self.send_deltas)?;
        }
        Ok(())
    }
}

fn send_dir_props(editor: &mut dyn Editor, dir: &DirBaton, base: Option<&NodeRev>, node: &NodeRev) -> Result<()> {
    let empty = PropertySet::new();
    for change in base.map(|b| &b.props).unwrap_or(&empty).diff(&node.props) {
        editor.change_dir_prop(dir, &change.name, change.value.as_deref())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Access, AllowAll};
    use crate::editor::EditRecorder;
    use crate::hooks::NoHooks;
    use crate::types::{CopyFrom, never_cancel};

    /// r1: /trunk/a.txt, /trunk/lib/b.txt
    /// r2: /tags/v1 copied from /trunk@1, /tags/v1/a.txt edited
    /// r3: /trunk/a.txt deleted, /trunk dir prop set
    fn repos() -> Repository {
        let repos = Repository::in_memory();
        let mut txn = repos.begin_txn_for_commit(None, Some("a"), "r1", &NoHooks).unwrap();
        txn.make_dir("/trunk").unwrap();
        txn.make_file("/trunk/a.txt").unwrap();
        txn.set_contents("/trunk/a.txt", "alpha\n").unwrap();
        txn.make_dir("/trunk/lib").unwrap();
        txn.make_file("/trunk/lib/b.txt").unwrap();
        txn.set_contents("/trunk/lib/b.txt", "beta\n").unwrap();
        txn.make_dir("/tags").unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();

        let mut txn = repos.begin_txn_for_commit(None, Some("a"), "r2", &NoHooks).unwrap();
        txn.copy(&CopyFrom::new("/trunk", 1), "/tags/v1").unwrap();
        txn.set_contents("/tags/v1/a.txt", "alpha v1\n").unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();

        let mut txn = repos.begin_txn_for_commit(None, Some("a"), "r3", &NoHooks).unwrap();
        txn.delete("/trunk/a.txt").unwrap();
        txn.change_node_prop("/trunk", "svn:ignore", Some("*.o")).unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();
        repos
    }

    fn replay(repos: &Repository, rev: Revnum, options: &ReplayOptions) -> EditRecorder {
        let mut rec = EditRecorder::new();
        repos.replay(rev, &mut rec, options, &AllowAll, &never_cancel).unwrap();
        rec
    }

    #[test]
    fn test_replay_copy_keeps_history() {
        let repos = repos();
        let rec = replay(&repos, 2, &ReplayOptions::default());
        assert_eq!(rec.target_revision, Some(2));
        assert_eq!(
            rec.calls,
            vec![
                "open_root",
                "open_directory tags",
                "add_directory tags/v1 from /trunk@1",
                "open_file tags/v1/a.txt",
                "apply_text_delta tags/v1/a.txt",
                "close_file tags/v1/a.txt",
                "close_directory tags/v1",
                "close_directory tags",
                "close_directory ",
                "close_edit",
            ]
        );
    }

    #[test]
    fn test_replay_below_low_water_mark_expands_copy() {
        let repos = repos();
        let options = ReplayOptions {
            low_water_mark: 2,
            ..Default::default()
        };
        let rec = replay(&repos, 2, &options);
        assert!(rec.calls.contains(&"add_directory tags/v1".to_string()));
        assert!(rec.calls.contains(&"add_file tags/v1/lib/b.txt".to_string()));
        assert!(rec.calls.contains(&"add_file tags/v1/a.txt".to_string()));
        assert!(!rec.calls.iter().any(|c| c.starts_with("open_file")));
    }

    #[test]
    fn test_replay_delete_and_dir_prop() {
        let repos = repos();
        let rec = replay(&repos, 3, &ReplayOptions::default());
        assert_eq!(
            rec.calls,
            vec![
                "open_root",
                "open_directory trunk",
                "change_dir_prop trunk svn:ignore=*.o",
                "delete_entry trunk/a.txt",
                "close_directory trunk",
                "close_directory ",
                "close_edit",
            ]
        );
    }

    #[test]
    fn test_replay_base_path_and_authz() {
        let repos = repos();
        let options = ReplayOptions {
            base_path: "/trunk".into(),
            ..Default::default()
        };
        let rec = replay(&repos, 1, &options);
        assert!(rec.calls.contains(&"add_file a.txt".to_string()));
        assert!(rec.touched_paths().iter().all(|p| !p.starts_with("tags")));

        let no_lib = |_: &str, p: &str, _: Option<&str>, _: Access| !path::is_ancestor("/trunk/lib", p);
        let mut rec = EditRecorder::new();
        repos
            .replay(1, &mut rec, &ReplayOptions::default(), &no_lib, &never_cancel)
            .unwrap();
        assert!(rec.touched_paths().iter().all(|p| !p.contains("lib")));
        assert!(rec.calls.contains(&"add_file trunk/a.txt".to_string()));
    }
}
