//! Tree of the nodes a revision changed, built by replaying it into
//! [`NodeEditor`].

use crate::authz::Authz;
use crate::delta::DeltaWindow;
use crate::editor::{BatonStack, DirBaton, Editor, FileBaton};
use crate::error::{ReposError, Result};
use crate::path;
use crate::replay::ReplayOptions;
use crate::repos::Repository;
use crate::types::{CopyFrom, NodeAction, NodeKind, Revnum, never_cancel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNode {
    /// Entry name; empty for the root
    pub name: String,
    pub kind: NodeKind,
    pub action: NodeAction,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copy_from: Option<CopyFrom>,
    pub children: Vec<ChangeNode>,
}

impl ChangeNode {
    fn new(name: &str, kind: NodeKind, action: NodeAction) -> Self {
        Self {
            name: name.to_string(),
            kind,
            action,
            text_mod: false,
            prop_mod: false,
            copy_from: None,
            children: Vec::new(),
        }
    }

    /// Descendant at a relative path
    pub fn find(&self, rel: &str) -> Option<&ChangeNode> {
        let mut node = self;
        for name in path::components(rel) {
            node = node.children.iter().find(|c| c.name == name)?;
        }
        Some(node)
    }

    /// Every node beneath this one as (relative path, node), parents first
    pub fn walk(&self) -> Vec<(String, &ChangeNode)> {
        let mut out = Vec::new();
        self.walk_into("", &mut out);
        out
    }

    fn walk_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a ChangeNode)>) {
        for child in &self.children {
            let at = path::join(prefix, &child.name);
            out.push((at.clone(), child));
            child.walk_into(&at, out);
        }
    }
}

/// Editor that collects the calls it receives into a [`ChangeNode`] tree
#[derive(Debug, Default)]
pub struct NodeEditor {
    stack: BatonStack,
    open: Vec<ChangeNode>,
    root: Option<ChangeNode>,
}

impl NodeEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finished tree; `None` until the edit is closed.
    pub fn into_tree(self) -> Option<ChangeNode> {
        self.root
    }

    fn top(&mut self) -> Result<&mut ChangeNode> {
        self.open
            .last_mut()
            .ok_or_else(|| ReposError::protocol("no open node"))
    }

    fn begin_add(&mut self, name: &str, kind: NodeKind, copy_from: Option<CopyFrom>) -> Result<()> {
        let parent = self.top()?;
        let mut action = NodeAction::Add;
        if let Some(pos) = parent
            .children
            .iter()
            .position(|c| c.name == name && c.action == NodeAction::Delete)
        {
            parent.children.remove(pos);
            action = NodeAction::Replace;
        }
        let mut node = ChangeNode::new(name, kind, action);
        node.copy_from = copy_from;
        self.open.push(node);
        Ok(())
    }

    fn finish_node(&mut self) -> Result<()> {
        let node = self
            .open
            .pop()
            .ok_or_else(|| ReposError::protocol("no open node"))?;
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.root = Some(node),
        }
        Ok(())
    }
}

impl Editor for NodeEditor {
    fn set_target_revision(&mut self, _rev: Revnum) -> Result<()> {
        Ok(())
    }

    fn open_root(&mut self, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let root = self.stack.open_root()?;
        self.open.push(ChangeNode::new("", NodeKind::Dir, NodeAction::Modify));
        Ok(root)
    }

    fn delete_entry(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<()> {
        self.stack.entry_path(parent, name)?;
        self.top()?
            .children
            .push(ChangeNode::new(name, NodeKind::Unknown, NodeAction::Delete));
        Ok(())
    }

    fn add_directory(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        self.begin_add(name, NodeKind::Dir, copy_from)?;
        Ok(dir)
    }

    fn open_directory(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        self.open.push(ChangeNode::new(name, NodeKind::Dir, NodeAction::Modify));
        Ok(dir)
    }

    fn change_dir_prop(&mut self, dir: &DirBaton, _name: &str, _value: Option<&str>) -> Result<()> {
        self.stack.check_dir(dir)?;
        self.top()?.prop_mod = true;
        Ok(())
    }

    fn close_directory(&mut self, dir: DirBaton) -> Result<()> {
        self.stack.pop_dir(dir)?;
        self.finish_node()
    }

    fn add_file(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        self.begin_add(name, NodeKind::File, copy_from)?;
        Ok(file)
    }

    fn open_file(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        self.open.push(ChangeNode::new(name, NodeKind::File, NodeAction::Modify));
        Ok(file)
    }

    fn apply_text_delta(&mut self, file: &FileBaton, _base_checksum: Option<&str>) -> Result<()> {
        self.stack.begin_delta(file)?;
        self.top()?.text_mod = true;
        Ok(())
    }

    fn text_delta_window(&mut self, file: &FileBaton, window: Option<&DeltaWindow>) -> Result<()> {
        self.stack.delta_window(file, window.is_none())
    }

    fn change_file_prop(&mut self, file: &FileBaton, _name: &str, _value: Option<&str>) -> Result<()> {
        self.stack.check_file(file)?;
        self.top()?.prop_mod = true;
        Ok(())
    }

    fn close_file(&mut self, file: FileBaton, _text_checksum: Option<&str>) -> Result<()> {
        self.stack.pop_file(file)?;
        self.finish_node()
    }

    fn close_edit(&mut self) -> Result<()> {
        self.stack.close_edit()
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.stack.abort();
        self.open.clear();
        self.root = None;
        Ok(())
    }
}

impl Repository {
    /// The nodes changed in `rev`, as seen by `user`.
    pub fn delta_tree(&self, rev: Revnum, authz: &dyn Authz, user: Option<&str>) -> Result<ChangeNode> {
        let options = ReplayOptions {
            send_deltas: false,
            user: user.map(str::to_string),
            ..Default::default()
        };
        let mut editor = NodeEditor::new();
        self.replay(rev, &mut editor, &options, authz, &never_cancel)?;
        editor
            .into_tree()
            .ok_or_else(|| ReposError::protocol(format!("replay of r{} did not close the edit", rev)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::hooks::NoHooks;

    #[test]
    fn test_delta_tree_actions() {
        let repos = Repository::in_memory();
        let mut txn = repos.begin_txn_for_commit(None, Some("a"), "r1", &NoHooks).unwrap();
        txn.make_dir("/d").unwrap();
        txn.make_file("/d/f").unwrap();
        txn.set_contents("/d/f", "one").unwrap();
        txn.make_file("/g").unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();

        let mut txn = repos.begin_txn_for_commit(None, Some("a"), "r2", &NoHooks).unwrap();
        txn.set_contents("/d/f", "two").unwrap();
        txn.change_node_prop("/d/f", "svn:eol-style", Some("native")).unwrap();
        txn.delete("/g").unwrap();
        txn.make_dir("/g").unwrap();
        txn.copy(&CopyFrom::new("/d", 1), "/e").unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();

        let tree = repos.delta_tree(2, &AllowAll, None).unwrap();
        assert_eq!(tree.action, NodeAction::Modify);

        let f = tree.find("d/f").unwrap();
        assert_eq!(f.action, NodeAction::Modify);
        assert!(f.text_mod && f.prop_mod);

        let g = tree.find("g").unwrap();
        assert_eq!(g.action, NodeAction::Replace);
        assert_eq!(g.kind, NodeKind::Dir);

        let e = tree.find("e").unwrap();
        assert_eq!(e.action, NodeAction::Add);
        assert_eq!(e.copy_from, Some(CopyFrom::new("/d", 1)));

        let paths: Vec<String> = tree.walk().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["d", "d/f", "e", "g"]);
    }
}
