//! Replaying a dump stream into a repository, one commit per revision

use super::reader::{DumpReader, DumpRecord, NodeRecord, RevisionRecord};
use super::{LoadOptions, UuidAction};
use crate::authz::{AccessCheck, AllowAll};
use crate::delta::DeltaDecoder;
use crate::editor::{Editor, FileBaton, send_text_delta};
use crate::error::{ReposError, Result};
use crate::hooks::{Hooks, TxnInfo};
use crate::path;
use crate::props::{PropChange, PropertySet, svn_props};
use crate::replay::PathDriver;
use crate::repos::Repository;
use crate::txn::{CommitEditor, Transaction};
use crate::types::{CancelFn, CopyFrom, NodeAction, NodeKind, Revnum, check_cancel};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::BufRead;

const PADDING_LOG: &str = "This is an empty revision for padding.";

/// Summary of one `load_fs` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// Revisions committed from the stream
    pub revisions: u64,
    pub nodes: u64,
    /// Empty revisions committed to keep dumped numbers
    pub padded: u64,
    /// Dumped revision number to the revision it was committed as
    pub revision_map: BTreeMap<Revnum, Revnum>,
}

/// Load a dump stream into `repos`.
///
/// Each dumped revision is committed as it is read. A revision that fails
/// aborts its own transaction; revisions committed before it stay.
pub fn load_fs<R: BufRead>(
    repos: &Repository,
    input: R,
    options: &LoadOptions,
    hooks: &dyn Hooks,
    cancel: CancelFn<'_>,
    feedback: &mut dyn FnMut(&str),
) -> Result<LoadStats> {
    if options.preserve_revisions && repos.youngest_rev()? != 0 {
        return Err(ReposError::protocol(
            "revision numbers can only be preserved when loading into an empty repository",
        ));
    }
    let mut loader = Loader {
        repos,
        options,
        hooks: LoadHooks {
            inner: hooks,
            pre: options.use_pre_commit_hook,
            post: options.use_post_commit_hook,
        },
        parent_dir: options.parent_dir.as_deref().map(path::canonicalize),
        cancel,
        stats: LoadStats::default(),
    };

    let mut reader = DumpReader::new(input);
    while let Some(record) = reader.next_record()? {
        check_cancel(cancel)?;
        match record {
            DumpRecord::FormatVersion(version) => tracing::debug!("Loading dump format version {}", version),
            DumpRecord::Uuid(uuid) => loader.apply_uuid(&uuid)?,
            DumpRecord::Revision(revision) => loader.load_revision(&mut reader, revision, feedback)?,
            DumpRecord::Node(node) => {
                return Err(ReposError::malformed(
                    node.offset,
                    reader.current_revision(),
                    "node record outside a revision",
                ));
            }
        }
    }
    tracing::info!(
        "Loaded {} revisions ({} nodes, {} padding revisions)",
        loader.stats.revisions,
        loader.stats.nodes,
        loader.stats.padded
    );
    Ok(loader.stats)
}

/// Runs the wrapped hooks only where the load options ask for them
struct LoadHooks<'a> {
    inner: &'a dyn Hooks,
    pre: bool,
    post: bool,
}

impl Hooks for LoadHooks<'_> {
    fn start_commit(&self, user: Option<&str>) -> Result<()> {
        if self.pre {
            self.inner.start_commit(user)
        } else {
            Ok(())
        }
    }

    fn pre_commit(&self, txn: &TxnInfo) -> Result<()> {
        if self.pre {
            self.inner.pre_commit(txn)
        } else {
            Ok(())
        }
    }

    fn post_commit(&self, rev: Revnum, txn: &TxnInfo) -> Result<()> {
        if self.post {
            self.inner.post_commit(rev, txn)
        } else {
            Ok(())
        }
    }
}

struct Loader<'a> {
    repos: &'a Repository,
    options: &'a LoadOptions,
    hooks: LoadHooks<'a>,
    parent_dir: Option<String>,
    cancel: CancelFn<'a>,
    stats: LoadStats,
}

impl Loader<'_> {
    fn apply_uuid(&self, uuid: &str) -> Result<()> {
        let take = match self.options.uuid_action {
            UuidAction::Force => true,
            UuidAction::Ignore => false,
            UuidAction::Default => self.repos.youngest_rev()? == 0,
        };
        if take {
            self.repos.set_uuid(uuid)?;
            tracing::info!("Repository UUID set to {}", uuid);
        }
        Ok(())
    }

    fn load_revision<R: BufRead>(
        &mut self,
        reader: &mut DumpReader<R>,
        record: RevisionRecord,
        feedback: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let dumped = record.revision;
        if dumped == 0 {
            if let Some(DumpRecord::Node(node)) = reader.peek_record()? {
                return Err(ReposError::malformed(node.offset, Some(0), "revision 0 cannot change nodes"));
            }
            if self.repos.youngest_rev()? == 0 && !record.props.is_empty() {
                self.repos.set_revision_props(0, record.props)?;
            }
            self.stats.revision_map.insert(0, 0);
            return Ok(());
        }

        if self.options.preserve_revisions {
            self.pad_to(dumped)?;
        }

        feedback(&format!("<<< Started new transaction, based on original revision {}", dumped));
        let author = record.props.get(svn_props::REVISION_AUTHOR).map(String::as_str);
        let log = record
            .props
            .get(svn_props::REVISION_LOG)
            .map(String::as_str)
            .unwrap_or_default();
        let mut txn = self.repos.begin_txn_for_commit(None, author, log, &self.hooks)?;

        let nodes = match self.apply_nodes(reader, &mut txn, dumped, feedback) {
            Ok(nodes) => nodes,
            Err(e) => {
                abort_quietly(&mut txn);
                return Err(e);
            }
        };
        let rev = match self.repos.commit(&mut txn, &self.hooks) {
            Ok(rev) => rev,
            Err(e) => {
                abort_quietly(&mut txn);
                return Err(e);
            }
        };

        let mut props = record.props;
        if props.get(svn_props::REVISION_DATE).is_none() {
            if let Some(date) = self.repos.revision(rev)?.props.get(svn_props::REVISION_DATE) {
                props.set(svn_props::REVISION_DATE, date.clone());
            }
        }
        self.repos.set_revision_props(rev, props)?;

        self.stats.revision_map.insert(dumped, rev);
        self.stats.revisions += 1;
        self.stats.nodes += nodes;
        if rev == dumped {
            feedback(&format!("------- Committed revision {} >>>", rev));
        } else {
            feedback(&format!(
                "------- Committed new rev {} (loaded from original rev {}) >>>",
                rev, dumped
            ));
        }
        tracing::info!("Loaded revision {} as r{} ({} nodes)", dumped, rev, nodes);
        Ok(())
    }

    /// Commit empty revisions until the next one is `dumped`.
    fn pad_to(&mut self, dumped: Revnum) -> Result<()> {
        while self.repos.youngest_rev()? + 1 < dumped {
            let mut txn = self.repos.begin_txn_for_commit(None, None, PADDING_LOG, &self.hooks)?;
            let rev = self.repos.commit(&mut txn, &self.hooks)?;
            self.stats.padded += 1;
            tracing::debug!("Committed padding revision {}", rev);
        }
        Ok(())
    }

    /// Apply the node records of one revision; returns how many there were.
    fn apply_nodes<R: BufRead>(
        &self,
        reader: &mut DumpReader<R>,
        txn: &mut Transaction,
        revision: Revnum,
        feedback: &mut dyn FnMut(&str),
    ) -> Result<u64> {
        let allow = AllowAll;
        let check = AccessCheck::new(&allow, self.repos.name(), None);
        let mut editor = txn.commit_editor(check);
        if let Some(parent) = &self.parent_dir {
            editor = editor.rooted_at(parent);
        }
        let mut driver = PathDriver::start(&mut editor, None)?;

        let mut count = 0;
        while let Some(DumpRecord::Node(_)) = reader.peek_record()? {
            let Some(DumpRecord::Node(node)) = reader.next_record()? else {
                break;
            };
            check_cancel(self.cancel)?;
            feedback(&format!("     * {} path : {} ... done.", action_verb(node.action), node.path));
            self.apply_node(&mut editor, &mut driver, &node, revision)?;
            count += 1;
        }
        driver.finish(&mut editor)?;
        Ok(count)
    }

    fn apply_node(
        &self,
        editor: &mut CommitEditor<'_>,
        driver: &mut PathDriver,
        node: &NodeRecord,
        revision: Revnum,
    ) -> Result<()> {
        let rel = node.path.as_str();
        if rel.is_empty() && node.action != NodeAction::Modify {
            return Err(ReposError::malformed(
                node.offset,
                Some(revision),
                format!("cannot {} the root directory", node.action.dump_tag()),
            ));
        }
        let parent = path::dirname(rel);
        let name = path::basename(rel);

        if matches!(node.action, NodeAction::Delete | NodeAction::Replace) {
            let dir = driver.open_dir(editor, parent)?;
            editor.delete_entry(dir, name, None)?;
            if node.action == NodeAction::Delete {
                return Ok(());
            }
        }

        let adding = node.action != NodeAction::Modify;
        let kind = match (node.kind, adding) {
            (Some(kind), _) => kind,
            (None, false) => editor.node_at(rel).map(|n| n.kind()).unwrap_or(NodeKind::None),
            (None, true) => {
                return Err(ReposError::malformed(
                    node.offset,
                    Some(revision),
                    format!("added node '{}' has no Node-kind", rel),
                ));
            }
        };
        let copy_from = match &node.copy_from {
            Some(cf) => Some(self.map_copy_source(cf, node, revision)?),
            None => None,
        };

        match kind {
            NodeKind::Dir => {
                if adding {
                    let parent_dir = driver.open_dir(editor, parent)?;
                    let dir = editor.add_directory(parent_dir, name, copy_from)?;
                    driver.push(rel.to_string(), dir);
                } else {
                    driver.open_dir(editor, rel)?;
                }
                let changes = prop_changes(editor, rel, node);
                let dir = driver.top()?;
                for change in &changes {
                    editor.change_dir_prop(dir, &change.name, change.value.as_deref())?;
                }
            }
            NodeKind::File => {
                let parent_dir = driver.open_dir(editor, parent)?;
                let file = if adding {
                    editor.add_file(parent_dir, name, copy_from)?
                } else {
                    editor.open_file(parent_dir, name, None)?
                };
                for change in &prop_changes(editor, rel, node) {
                    editor.change_file_prop(&file, &change.name, change.value.as_deref())?;
                }
                if let Some(text) = &node.text {
                    if node.text_delta {
                        editor.apply_text_delta(&file, node.text_delta_base_sha1.as_deref())?;
                        let mut decoder = DeltaDecoder::new(&text[..]);
                        while let Some(window) = decoder.next_window()? {
                            editor.text_delta_window(&file, Some(&window))?;
                        }
                        editor.text_delta_window(&file, None)?;
                    } else {
                        send_full_text(editor, &file, text)?;
                    }
                }
                editor.close_file(file, node.text_content_sha1.as_deref())?;
            }
            _ => {
                return Err(ReposError::not_found(
                    &path::join(self.parent_dir.as_deref().unwrap_or("/"), rel),
                    format!("loaded revision {}", revision),
                ));
            }
        }
        Ok(())
    }

    /// Translate a dumped copy source into this repository's numbering and
    /// placement.
    fn map_copy_source(&self, cf: &CopyFrom, node: &NodeRecord, revision: Revnum) -> Result<CopyFrom> {
        let rev = match self.stats.revision_map.get(&cf.rev) {
            Some(rev) => *rev,
            None if cf.rev <= self.repos.youngest_rev()? => {
                tracing::warn!("Copy source r{} of {} is not in the stream; using it as is", cf.rev, node.path);
                cf.rev
            }
            None => {
                return Err(ReposError::malformed(
                    node.offset,
                    Some(revision),
                    format!("copy source revision {} of '{}' was not loaded", cf.rev, node.path),
                ));
            }
        };
        let from = match &self.parent_dir {
            Some(parent) => path::join(parent, &cf.path),
            None => cf.path.clone(),
        };
        Ok(CopyFrom::new(&from, rev))
    }
}

fn send_full_text(editor: &mut dyn Editor, file: &FileBaton, text: &[u8]) -> Result<()> {
    send_text_delta(editor, file, None, text, true)
}

/// Property changes a node record makes to the node as edited so far.
fn prop_changes(editor: &CommitEditor<'_>, rel: &str, node: &NodeRecord) -> Vec<PropChange> {
    match &node.props {
        None => Vec::new(),
        Some(changes) if node.prop_delta => changes.clone(),
        Some(changes) => {
            let target: PropertySet = changes
                .iter()
                .filter_map(|c| c.value.clone().map(|v| (c.name.clone(), v)))
                .collect();
            let current = editor.node_at(rel).map(|n| n.props.clone()).unwrap_or_default();
            current.diff(&target)
        }
    }
}

fn abort_quietly(txn: &mut Transaction) {
    if txn.is_open() {
        if let Err(e) = txn.abort() {
            tracing::debug!("Abort of {} failed: {}", txn.name(), e);
        }
    }
}

fn action_verb(action: NodeAction) -> &'static str {
    match action {
        NodeAction::Add => "adding",
        NodeAction::Delete => "deleting",
        NodeAction::Replace => "replacing",
        NodeAction::Modify => "editing",
    }
}
