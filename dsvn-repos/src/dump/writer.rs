//! Dump stream writer
//!
//! Each revision is turned into node records by driving [`DumpEditor`]:
//! the first revision of a full dump is compared against the empty tree,
//! every other revision is replayed against its predecessor.

use super::DumpOptions;
use super::format::{self, DUMP_FORMAT_VERSION, Headers, encode_prop_delta, encode_props};
use crate::authz::{AccessCheck, AllowAll};
use crate::compare::{PathInfo, ReportMap, TreeDelta};
use crate::delta::{DeltaEncoder, DeltaWindow};
use crate::editor::{BatonStack, DirBaton, Editor, FileBaton};
use crate::error::{ReposError, Result};
use crate::path;
use crate::props::PropChange;
use crate::replay::Replay;
use crate::repos::Repository;
use crate::storage::Revision;
use crate::tree::Tree;
use crate::types::{CancelFn, CopyFrom, NodeAction, NodeKind, Revnum, check_cancel, sha1_hex};
use std::io::Write;

/// Write revisions `options.start..=options.end` of `repos` to `out`.
///
/// Cancellation is checked before each revision and each node record.
/// A revision's records are buffered and reach `out` only once the whole
/// revision has been produced, so a cancelled dump ends with the last
/// complete revision.
pub fn dump_fs<W: Write>(
    repos: &Repository,
    out: &mut W,
    options: &DumpOptions,
    cancel: CancelFn<'_>,
    feedback: &mut dyn FnMut(&str),
) -> Result<()> {
    let youngest = repos.youngest_rev()?;
    let end = options.end.unwrap_or(youngest);
    if end > youngest {
        return Err(ReposError::NoSuchRevision(end));
    }
    if options.start > end {
        return Err(ReposError::protocol(format!(
            "start revision {} is greater than end revision {}",
            options.start, end
        )));
    }

    Headers::from_pair(format::FORMAT_VERSION, DUMP_FORMAT_VERSION).write_to(out)?;
    if !options.incremental {
        Headers::from_pair(format::UUID, repos.uuid()?).write_to(out)?;
    }

    let allow = AllowAll;
    for rev in options.start..=end {
        check_cancel(cancel)?;
        let revision = repos.revision(rev)?;
        let mut record = Vec::new();
        write_revision_record(&mut record, &revision)?;

        if rev > 0 {
            let check = AccessCheck::new(&allow, repos.name(), None);
            let mut editor = DumpEditor::new(&mut record, &revision.root, options.use_deltas, cancel);
            if rev == options.start && !options.incremental {
                let mut report = ReportMap::new();
                report.insert(
                    String::new(),
                    PathInfo::Present {
                        rev: 0,
                        link: None,
                        start_empty: true,
                        lock_token: None,
                    },
                );
                TreeDelta::new(repos.storage().as_ref(), &revision.root, &report, check, cancel)
                    .text_deltas(options.use_deltas)
                    .drive(&mut editor, rev, "/", "", "/")?;
            } else {
                let replay = Replay {
                    storage: repos.storage().as_ref(),
                    check,
                    cancel,
                    low_water_mark: if options.incremental { 0 } else { options.start },
                    send_deltas: options.use_deltas,
                };
                replay.drive(&mut editor, &revision, "/")?;
            }
        }
        out.write_all(&record)?;

        feedback(&format!("* Dumped revision {}.", rev));
        tracing::info!("Dumped revision {} of {}", rev, end);
    }
    out.flush()?;
    Ok(())
}

fn write_revision_record(out: &mut dyn Write, revision: &Revision) -> Result<()> {
    let props = encode_props(&revision.props);
    let mut headers = Headers::new();
    headers.push(format::REVISION_NUMBER, revision.rev);
    headers.push(format::PROP_CONTENT_LENGTH, props.len());
    headers.push(format::CONTENT_LENGTH, props.len());
    headers.write_to(out)?;
    out.write_all(&props)?;
    writeln!(out)?;
    Ok(())
}

/// One node record waiting to be written
#[derive(Debug)]
struct PendingNode {
    /// Repository path without the leading slash
    path: String,
    kind: NodeKind,
    action: NodeAction,
    copy_from: Option<CopyFrom>,
    prop_changes: Vec<PropChange>,
}

impl PendingNode {
    fn new(path: &str, kind: NodeKind, action: NodeAction, copy_from: Option<CopyFrom>) -> Self {
        Self {
            path: path.to_string(),
            kind,
            action,
            copy_from,
            prop_changes: Vec::new(),
        }
    }

    fn is_plain_add(&self) -> bool {
        matches!(self.action, NodeAction::Add | NodeAction::Replace) && self.copy_from.is_none()
    }
}

struct DirState {
    node: PendingNode,
    written: bool,
    /// Entries deleted in this directory and not added back
    deletes: Vec<String>,
}

struct FileState {
    node: PendingNode,
    text: Option<TextCapture>,
}

struct TextCapture {
    base_checksum: Option<String>,
    encoder: Option<DeltaEncoder<Vec<u8>>>,
}

/// Writes node records to the stream
struct RecordSink<'a> {
    out: &'a mut dyn Write,
    tree: &'a Tree,
    use_deltas: bool,
    cancel: CancelFn<'a>,
}

impl RecordSink<'_> {
    fn write_delete(&mut self, at: &str) -> Result<()> {
        check_cancel(self.cancel)?;
        let mut headers = Headers::new();
        headers.push(format::NODE_PATH, at);
        headers.push(format::NODE_ACTION, NodeAction::Delete.dump_tag());
        headers.write_to(self.out)?;
        writeln!(self.out)?;
        Ok(())
    }

    /// Write a directory record if it adds the directory or changes its
    /// properties.
    fn write_dir(&mut self, node: &mut PendingNode) -> Result<()> {
        if node.action == NodeAction::Modify && node.prop_changes.is_empty() {
            return Ok(());
        }
        self.write_node(node, None)?;
        node.prop_changes.clear();
        Ok(())
    }

    fn write_node(&mut self, node: &PendingNode, text: Option<TextCapture>) -> Result<()> {
        check_cancel(self.cancel)?;
        let target = self.tree.node(&path::join("/", &node.path))?;

        let mut headers = Headers::new();
        headers.push(format::NODE_PATH, &node.path);
        headers.push(format::NODE_KIND, node.kind.as_str());
        headers.push(format::NODE_ACTION, node.action.dump_tag());
        if let Some(cf) = &node.copy_from {
            headers.push(format::NODE_COPYFROM_REV, cf.rev);
            headers.push(format::NODE_COPYFROM_PATH, path::canonicalize_relative(&cf.path));
        }

        let props = if node.is_plain_add() || (!node.prop_changes.is_empty() && !self.use_deltas) {
            Some(encode_props(&target.props))
        } else if !node.prop_changes.is_empty() {
            headers.push(format::PROP_DELTA, "true");
            Some(encode_prop_delta(&node.prop_changes))
        } else {
            None
        };

        let contents = target.text().cloned().unwrap_or_default();
        let text = match text {
            Some(TextCapture {
                base_checksum,
                encoder: Some(encoder),
            }) => {
                headers.push(format::TEXT_DELTA, "true");
                if let Some(sha1) = base_checksum {
                    headers.push(format::TEXT_DELTA_BASE_SHA1, sha1);
                }
                Some(encoder.finish()?)
            }
            Some(_) => Some(contents.to_vec()),
            None => None,
        };
        if text.is_some() {
            headers.push(format::TEXT_CONTENT_SHA1, sha1_hex(&contents));
        }

        if let Some(p) = &props {
            headers.push(format::PROP_CONTENT_LENGTH, p.len());
        }
        if let Some(t) = &text {
            headers.push(format::TEXT_CONTENT_LENGTH, t.len());
        }
        let total = props.as_ref().map_or(0, Vec::len) + text.as_ref().map_or(0, Vec::len);
        let has_content = props.is_some() || text.is_some();
        if has_content {
            headers.push(format::CONTENT_LENGTH, total);
        }

        tracing::debug!("dump node {} {}", node.action.dump_tag(), node.path);
        headers.write_to(self.out)?;
        if let Some(p) = &props {
            self.out.write_all(p)?;
        }
        if let Some(t) = &text {
            self.out.write_all(t)?;
        }
        if has_content {
            writeln!(self.out)?;
        }
        writeln!(self.out)?;
        Ok(())
    }
}

/// Editor that writes the node records of one revision
///
/// Directory records are held back until something happens inside the
/// directory, so that property changes sent right after `add_directory`
/// land in the same record. Deletes are held until the parent closes and
/// become replaces when the same name is added back.
struct DumpEditor<'a> {
    sink: RecordSink<'a>,
    stack: BatonStack,
    dirs: Vec<DirState>,
    file: Option<FileState>,
}

impl<'a> DumpEditor<'a> {
    fn new(out: &'a mut dyn Write, tree: &'a Tree, use_deltas: bool, cancel: CancelFn<'a>) -> Self {
        Self {
            sink: RecordSink {
                out,
                tree,
                use_deltas,
                cancel,
            },
            stack: BatonStack::new(),
            dirs: Vec::new(),
            file: None,
        }
    }

    /// Write the innermost directory's record if still pending.
    fn flush_dir(&mut self) -> Result<()> {
        let state = self
            .dirs
            .last_mut()
            .ok_or_else(|| ReposError::protocol("no open directory"))?;
        if !state.written {
            state.written = true;
            self.sink.write_dir(&mut state.node)?;
        }
        Ok(())
    }

    /// Action for a new entry: a replace if the name was deleted first.
    fn add_action(&mut self, name: &str) -> Result<NodeAction> {
        let state = self
            .dirs
            .last_mut()
            .ok_or_else(|| ReposError::protocol("no open directory"))?;
        match state.deletes.iter().position(|d| d == name) {
            Some(pos) => {
                state.deletes.remove(pos);
                Ok(NodeAction::Replace)
            }
            None => Ok(NodeAction::Add),
        }
    }

    fn begin_dir(&mut self, dir: &DirBaton, action: NodeAction, copy_from: Option<CopyFrom>) {
        self.dirs.push(DirState {
            node: PendingNode::new(dir.path(), NodeKind::Dir, action, copy_from),
            written: false,
            deletes: Vec::new(),
        });
    }

    fn file_state(&mut self) -> Result<&mut FileState> {
        self.file
            .as_mut()
            .ok_or_else(|| ReposError::protocol("no open file"))
    }
}

impl Editor for DumpEditor<'_> {
    fn set_target_revision(&mut self, _rev: Revnum) -> Result<()> {
        Ok(())
    }

    fn open_root(&mut self, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let root = self.stack.open_root()?;
        self.begin_dir(&root, NodeAction::Modify, None);
        Ok(root)
    }

    fn delete_entry(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<()> {
        self.stack.entry_path(parent, name)?;
        self.flush_dir()?;
        if let Some(state) = self.dirs.last_mut() {
            state.deletes.push(name.to_string());
        }
        Ok(())
    }

    fn add_directory(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        self.flush_dir()?;
        let action = self.add_action(name)?;
        self.begin_dir(&dir, action, copy_from);
        Ok(dir)
    }

    fn open_directory(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<DirBaton> {
        let dir = self.stack.push_dir(parent, name)?;
        self.flush_dir()?;
        self.begin_dir(&dir, NodeAction::Modify, None);
        Ok(dir)
    }

    fn change_dir_prop(&mut self, dir: &DirBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_dir(dir)?;
        let state = self
            .dirs
            .last_mut()
            .ok_or_else(|| ReposError::protocol("no open directory"))?;
        state.node.prop_changes.push(PropChange {
            name: name.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }

    fn close_directory(&mut self, dir: DirBaton) -> Result<()> {
        self.stack.pop_dir(dir)?;
        let mut state = self
            .dirs
            .pop()
            .ok_or_else(|| ReposError::protocol("no open directory"))?;
        if state.written {
            // Late property changes go into a record of their own.
            state.node.action = NodeAction::Modify;
            state.node.copy_from = None;
        }
        self.sink.write_dir(&mut state.node)?;
        for name in &state.deletes {
            self.sink.write_delete(&path::join(&state.node.path, name))?;
        }
        Ok(())
    }

    fn add_file(&mut self, parent: &DirBaton, name: &str, copy_from: Option<CopyFrom>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        self.flush_dir()?;
        let action = self.add_action(name)?;
        self.file = Some(FileState {
            node: PendingNode::new(file.path(), NodeKind::File, action, copy_from),
            text: None,
        });
        Ok(file)
    }

    fn open_file(&mut self, parent: &DirBaton, name: &str, _base_revision: Option<Revnum>) -> Result<FileBaton> {
        let file = self.stack.push_file(parent, name)?;
        self.flush_dir()?;
        self.file = Some(FileState {
            node: PendingNode::new(file.path(), NodeKind::File, NodeAction::Modify, None),
            text: None,
        });
        Ok(file)
    }

    fn apply_text_delta(&mut self, file: &FileBaton, base_checksum: Option<&str>) -> Result<()> {
        self.stack.begin_delta(file)?;
        let use_deltas = self.sink.use_deltas;
        self.file_state()?.text = Some(TextCapture {
            base_checksum: base_checksum.map(str::to_string),
            encoder: use_deltas.then(|| DeltaEncoder::new(Vec::new())),
        });
        Ok(())
    }

    fn text_delta_window(&mut self, file: &FileBaton, window: Option<&DeltaWindow>) -> Result<()> {
        self.stack.delta_window(file, window.is_none())?;
        let Some(window) = window else {
            return Ok(());
        };
        if let Some(encoder) = self
            .file_state()?
            .text
            .as_mut()
            .and_then(|t| t.encoder.as_mut())
        {
            encoder.write_window(window)?;
        }
        Ok(())
    }

    fn change_file_prop(&mut self, file: &FileBaton, name: &str, value: Option<&str>) -> Result<()> {
        self.stack.check_file(file)?;
        self.file_state()?.node.prop_changes.push(PropChange {
            name: name.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }

    fn close_file(&mut self, file: FileBaton, _text_checksum: Option<&str>) -> Result<()> {
        self.stack.pop_file(file)?;
        let state = self
            .file
            .take()
            .ok_or_else(|| ReposError::protocol("no open file"))?;
        self.sink.write_node(&state.node, state.text)
    }

    fn close_edit(&mut self) -> Result<()> {
        self.stack.close_edit()
    }

    fn abort_edit(&mut self) -> Result<()> {
        self.stack.abort();
        self.dirs.clear();
        self.file = None;
        Ok(())
    }
}
