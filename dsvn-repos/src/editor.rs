//! Tree-delta editor protocol
//!
//! A driver describes a change to a tree by calling an [`Editor`] in one
//! depth-first pass: open or add a directory, describe its entries, close
//! it, move on. Batons returned by `open_*`/`add_*` name the node being
//! edited and are consumed by the matching `close_*` call.
//!
//! Consumers embed a [`BatonStack`] to reject calls made in the wrong order:
//! only the most recently opened baton may be used, a text delta must be
//! finished before its file is closed, and the edit can only be closed once
//! every baton is.

use crate::delta::{DeltaWindow, compute_delta};
use crate::error::{ReposError, Result};
use crate::path;
use crate::types::{CopyFrom, Revnum, sha1_hex};

pub type BatonId = u64;

/// Handle to an open directory
#[derive(Debug, PartialEq, Eq)]
pub struct DirBaton {
    id: BatonId,
    path: String,
}

impl DirBaton {
    /// Path relative to the edit root; `""` for the root itself
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> BatonId {
        self.id
    }
}

/// Handle to an open file
#[derive(Debug, PartialEq, Eq)]
pub struct FileBaton {
    id: BatonId,
    path: String,
}

impl FileBaton {
    /// Path relative to the edit root
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> BatonId {
        self.id
    }
}

/// Consumer side of the tree-delta protocol
///
/// Property values of `None` delete the property. Checksums are lowercase
/// hex SHA-1 of the full text.
pub trait Editor {
    fn set_target_revision(&mut self, rev: Revnum) -> Result<()>;

    fn open_root(&mut self, base_revision: Option<Revnum>) -> Result<DirBaton>;

    fn delete_entry(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<()>;

    fn add_directory(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<DirBaton>;

    fn open_directory(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<DirBaton>;

    fn change_dir_prop(&mut self, dir: &DirBaton, name: &str, value: Option<&str>) -> Result<()>;

    fn close_directory(&mut self, dir: DirBaton) -> Result<()>;

    fn add_file(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<FileBaton>;

    fn open_file(&mut self, parent: &DirBaton, name: &str, base_revision: Option<Revnum>) -> Result<FileBaton>;

    /// Start replacing the file's text; `base_checksum` identifies the text
    /// the windows apply to.
    fn apply_text_delta(&mut self, file: &FileBaton, base_checksum: Option<&str>) -> Result<()>;

    /// One window of the text delta; `None` ends the delta.
    fn text_delta_window(&mut self, file: &FileBaton, window: Option<&DeltaWindow>) -> Result<()>;

    fn change_file_prop(&mut self, file: &FileBaton, name: &str, value: Option<&str>) -> Result<()>;

    fn close_file(&mut self, file: FileBaton, text_checksum: Option<&str>) -> Result<()>;

    fn close_edit(&mut self) -> Result<()>;

    fn abort_edit(&mut self) -> Result<()>;
}

/// Send `target` as a text delta against `base`.
///
/// With `send_deltas` false the consumer only learns that the text changed:
/// the delta is opened and immediately closed.
pub fn send_text_delta(
    editor: &mut dyn Editor,
    file: &FileBaton,
    base: Option<&[u8]>,
    target: &[u8],
    send_deltas: bool,
) -> Result<()> {
    let base_checksum = base.map(sha1_hex);
    editor.apply_text_delta(file, base_checksum.as_deref())?;
    if send_deltas {
        let delta = compute_delta(base.unwrap_or(&[]), target);
        for window in &delta.windows {
            editor.text_delta_window(file, Some(window))?;
        }
    }
    editor.text_delta_window(file, None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Root,
    Dir,
    File,
}

#[derive(Debug)]
struct Frame {
    id: BatonId,
    kind: FrameKind,
    delta_open: bool,
}

/// Call-order state machine shared by every editor consumer
#[derive(Debug, Default)]
pub struct BatonStack {
    frames: Vec<Frame>,
    next_id: BatonId,
    root_opened: bool,
    finished: bool,
}

fn invalid(msg: impl std::fmt::Display) -> ReposError {
    ReposError::protocol(format!("invalid baton state: {}", msg))
}

impl BatonStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of open batons
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.finished {
            return Err(invalid("edit already closed"));
        }
        Ok(())
    }

    fn top_is(&self, id: BatonId, dir: bool) -> Result<&Frame> {
        self.ensure_live()?;
        let top = self
            .frames
            .last()
            .ok_or_else(|| invalid(format!("baton {} is not open", id)))?;
        if top.id != id {
            return Err(invalid(format!(
                "baton {} used while baton {} is innermost",
                id, top.id
            )));
        }
        let is_dir = matches!(top.kind, FrameKind::Root | FrameKind::Dir);
        if is_dir != dir {
            return Err(invalid(format!("baton {} has the wrong kind", id)));
        }
        Ok(top)
    }

    fn push(&mut self, kind: FrameKind) -> BatonId {
        self.next_id += 1;
        self.frames.push(Frame {
            id: self.next_id,
            kind,
            delta_open: false,
        });
        self.next_id
    }

    pub fn open_root(&mut self) -> Result<DirBaton> {
        self.ensure_live()?;
        if self.root_opened {
            return Err(invalid("root already opened"));
        }
        self.root_opened = true;
        let id = self.push(FrameKind::Root);
        Ok(DirBaton {
            id,
            path: String::new(),
        })
    }

    /// Check that `dir` may be used now.
    pub fn check_dir(&self, dir: &DirBaton) -> Result<()> {
        self.top_is(dir.id, true).map(|_| ())
    }

    /// Check that `file` may be used now.
    pub fn check_file(&self, file: &FileBaton) -> Result<()> {
        self.top_is(file.id, false).map(|_| ())
    }

    fn child_path(parent: &DirBaton, name: &str) -> Result<String> {
        if !path::is_valid_entry_name(name) {
            return Err(ReposError::protocol(format!("invalid entry name '{}'", name)));
        }
        Ok(path::join(&parent.path, name))
    }

    /// Validate a `delete_entry` and return the child's relative path.
    pub fn entry_path(&self, parent: &DirBaton, name: &str) -> Result<String> {
        self.check_dir(parent)?;
        Self::child_path(parent, name)
    }

    pub fn push_dir(&mut self, parent: &DirBaton, name: &str) -> Result<DirBaton> {
        let path = self.entry_path(parent, name)?;
        let id = self.push(FrameKind::Dir);
        Ok(DirBaton { id, path })
    }

    pub fn push_file(&mut self, parent: &DirBaton, name: &str) -> Result<FileBaton> {
        let path = self.entry_path(parent, name)?;
        let id = self.push(FrameKind::File);
        Ok(FileBaton { id, path })
    }

    pub fn pop_dir(&mut self, dir: DirBaton) -> Result<()> {
        self.check_dir(&dir)?;
        self.frames.pop();
        Ok(())
    }

    pub fn pop_file(&mut self, file: FileBaton) -> Result<()> {
        if self.top_is(file.id, false)?.delta_open {
            return Err(invalid(format!("text delta for '{}' still open", file.path)));
        }
        self.frames.pop();
        Ok(())
    }

    pub fn begin_delta(&mut self, file: &FileBaton) -> Result<()> {
        self.check_file(file)?;
        let top = self.frames.last_mut().ok_or_else(|| invalid("no open file"))?;
        if top.delta_open {
            return Err(invalid(format!("text delta for '{}' already open", file.path)));
        }
        top.delta_open = true;
        Ok(())
    }

    /// Accept one window; `end` closes the delta.
    pub fn delta_window(&mut self, file: &FileBaton, end: bool) -> Result<()> {
        self.check_file(file)?;
        let top = self.frames.last_mut().ok_or_else(|| invalid("no open file"))?;
        if !top.delta_open {
            return Err(invalid(format!("no text delta open for '{}'", file.path)));
        }
        if end {
            top.delta_open = false;
        }
        Ok(())
    }

    pub fn close_edit(&mut self) -> Result<()> {
        self.ensure_live()?;
        if !self.frames.is_empty() {
            return Err(invalid(format!("{} baton(s) still open", self.frames.len())));
        }
        self.finished = true;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.frames.clear();
        self.finished = true;
    }
}

/// Editor that records each call as one line of text
///
/// Useful for inspecting what a driver sends. Lines look like
/// `add_file a/b.txt` or `change_dir_prop a svn:ignore=*.o`; text windows
/// are not recorded individually.
#[derive(Debug, Default)]
pub struct EditRecorder {
    stack: BatonStack,
    pub calls: Vec<String>,
    pub target_revision: Option<Revnum>,
    pub windows: usize,
}

impl EditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative paths named by calls other than the root
    pub fn touched_paths(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| c.split_once(' ').map(|(_, rest)| rest))
            .map(|rest| rest.split(' ').next().unwrap_or_default().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    fn prop_line(call: &str, path: &str, name: &str, value: Option<&str>) -> String {
        match value {
            Some(v) => format!("{} {} {}={}", call, path, name, v),
            None => format!("{} {} {}", call, path, name),
        }
    }
}

impl Editor for EditRecorder {
    fn set_target_revision(&mut self, rev: Revnum) -> Result<()> {
        self.target_revision = Some(rev);
        Ok(())
    }

    fn open_root(&mut self, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let root = self.stack.open_root()?;
        self.calls.push("open_root".to_string());
        Ok(root)
    }

    fn delete_entry(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<()> {
        let path = self.stack.entry_path(parent, name)?;
        self.calls.push(format!("delete_entry {}", path));
        Ok(())
    }

    fn add_directory(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        match copy_from {
            Some(cf) => self.calls.push(format!("add_directory {} from {}", dir.path(), cf)),
            None => self.calls.push(format!("add_directory {}", dir.path())),
        }
        Ok(dir)
    }

    fn open_directory(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        self.calls.push(format!("open_directory {}", dir.path()));
        Ok(dir)
    }

    fn change_dir_prop(&mut self, dir: &DirBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_dir(dir)?;
        self.calls
            .push(Self::prop_line("change_dir_prop", dir.path(), name, value));
        Ok(())
    }

    fn close_directory(&mut self, dir: DirBaton) -> Result<()> {
        let line = format!("close_directory {}", dir.path());
        self.stack.pop_dir(dir)?;
        self.calls.push(line);
        Ok(())
    }

    fn add_file(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        match copy_from {
            Some(cf) => self.calls.push(format!("add_file {} from {}", file.path(), cf)),
            None => self.calls.push(format!("add_file {}", file.path())),
        }
        Ok(file)
    }

    fn open_file(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        self.calls.push(format!("open_file {}", file.path()));
        Ok(file)
    }

    fn apply_text_delta(&mut self, file: &FileBaton, _base_checksum: Option<&str>) -> Result<()> {
        self.stack.begin_delta(file)?;
        self.calls.push(format!("apply_text_delta {}", file.path()));
        Ok(())
    }

    fn text_delta_window(&mut self, file: &FileBaton, window: Option<&DeltaWindow>) -> Result<()> {
        self.stack.delta_window(file, window.is_none())?;
        if window.is_some() {
            self.windows += 1;
        }
        Ok(())
    }

    fn change_file_prop(&mut self, file: &FileBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_file(file)?;
        self.calls
            .push(Self::prop_line("change_file_prop", file.path(), name, value));
        Ok(())
    }

    fn close_file(&mut self, file: FileBaton, _text_checksum: Option<&str>) -> Result<()> {
        let line = format!("close_file {}", file.path());
        self.stack.pop_file(file)?;
        self.calls.push(line);
        Ok(())
    }

    fn close_edit(&mut self) -> Result<()> {
        self.stack.close_edit()?;
        self.calls.push("close_edit".to_string());
        Ok(())
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.stack.abort();
        self.calls.push("abort_edit".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_violation(r: Result<impl std::fmt::Debug>) -> bool {
        matches!(r, Err(ReposError::ProtocolViolation(_)))
    }

    #[test]
    fn test_well_nested_edit() {
        let mut ed = EditRecorder::new();
        ed.set_target_revision(3).unwrap();
        let root = ed.open_root(Some(2)).unwrap();
        let dir = ed.add_directory(&root, "src", None).unwrap();
        let file = ed.add_file(&dir, "main.rs", None).unwrap();
        send_text_delta(&mut ed, &file, None, b"fn main() {}\n", true).unwrap();
        ed.change_file_prop(&file, "svn:eol-style", Some("native")).unwrap();
        ed.close_file(file, None).unwrap();
        ed.close_directory(dir).unwrap();
        ed.delete_entry(&root, "old", None).unwrap();
        ed.close_directory(root).unwrap();
        ed.close_edit().unwrap();

        assert_eq!(ed.target_revision, Some(3));
        assert_eq!(ed.windows, 1);
        assert_eq!(
            ed.calls,
            vec![
                "open_root",
                "add_directory src",
                "add_file src/main.rs",
                "apply_text_delta src/main.rs",
                "change_file_prop src/main.rs svn:eol-style=native",
                "close_file src/main.rs",
                "close_directory src",
                "delete_entry old",
                "close_directory ",
                "close_edit",
            ]
        );
        assert_eq!(ed.touched_paths(), vec!["src", "src/main.rs", "src/main.rs", "src/main.rs", "src/main.rs", "src", "old"]);
    }

    #[test]
    fn test_parent_used_while_child_open() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        let dir = ed.open_directory(&root, "a", None).unwrap();
        assert!(is_violation(ed.add_file(&root, "x", None)));
        assert!(is_violation(ed.change_dir_prop(&root, "p", Some("v"))));
        assert!(is_violation(ed.close_directory(root)));
        ed.close_directory(dir).unwrap();
    }

    #[test]
    fn test_close_file_with_open_delta() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        let file = ed.add_file(&root, "f", None).unwrap();
        ed.apply_text_delta(&file, None).unwrap();
        assert!(is_violation(ed.apply_text_delta(&file, None)));
        assert!(is_violation(ed.close_file(file, None)));
    }

    #[test]
    fn test_window_without_delta() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        let file = ed.open_file(&root, "f", None).unwrap();
        assert!(is_violation(ed.text_delta_window(&file, None)));
        ed.close_file(file, None).unwrap();
        ed.close_directory(root).unwrap();
        ed.close_edit().unwrap();
    }

    #[test]
    fn test_close_edit_with_open_batons() {
        let mut ed = EditRecorder::new();
        let _root = ed.open_root(None).unwrap();
        assert!(is_violation(ed.close_edit()));
    }

    #[test]
    fn test_calls_after_close_or_abort() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        ed.abort_edit().unwrap();
        assert!(is_violation(ed.add_directory(&root, "a", None)));
        assert!(is_violation(ed.open_root(None)));

        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        ed.close_directory(root).unwrap();
        ed.close_edit().unwrap();
        assert!(is_violation(ed.close_edit()));
    }

    #[test]
    fn test_invalid_names() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        assert!(is_violation(ed.add_file(&root, "a/b", None)));
        assert!(is_violation(ed.add_file(&root, "..", None)));
        assert!(is_violation(ed.delete_entry(&root, "", None)));
    }

    #[test]
    fn test_send_text_delta_without_windows() {
        let mut ed = EditRecorder::new();
        let root = ed.open_root(None).unwrap();
        let file = ed.open_file(&root, "f", None).unwrap();
        send_text_delta(&mut ed, &file, Some(b"old"), b"new", false).unwrap();
        assert_eq!(ed.windows, 0);
        ed.close_file(file, None).unwrap();
    }
}
