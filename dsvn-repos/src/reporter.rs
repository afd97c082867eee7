//! Reporter: a client describes its working copy, the server drives an
//! editor with the changes that bring it to the target revision.

use crate::authz::{AccessCheck, Authz};
use crate::compare::{PathInfo, ReportMap, TreeDelta};
use crate::editor::Editor;
use crate::error::{ReposError, Result};
use crate::path;
use crate::repos::Repository;
use crate::types::{CancelFn, Revnum};

/// Parameters of one update, switch or status report
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Target revision; youngest when `None`
    pub revision: Option<Revnum>,
    pub user: Option<String>,
    /// Anchor directory of the working copy
    pub fs_base: String,
    /// Entry beneath the anchor being updated; empty for the anchor itself
    pub target: String,
    /// Repository path the target is switched to
    pub switch_path: Option<String>,
    pub text_deltas: bool,
    pub ignore_ancestry: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            revision: None,
            user: None,
            fs_base: "/".to_string(),
            target: String::new(),
            switch_path: None,
            text_deltas: true,
            ignore_ancestry: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportState {
    Open,
    Finished,
    Aborted,
}

pub struct Reporter<'a> {
    repos: &'a Repository,
    editor: &'a mut dyn Editor,
    authz: &'a dyn Authz,
    cancel: CancelFn<'a>,
    options: ReportOptions,
    revnum: Revnum,
    youngest: Revnum,
    entries: ReportMap,
    state: ReportState,
}

impl Repository {
    /// Start a report against `options.revision`.
    pub fn begin_report<'a>(
        &'a self,
        options: ReportOptions,
        editor: &'a mut dyn Editor,
        authz: &'a dyn Authz,
        cancel: CancelFn<'a>,
    ) -> Result<Reporter<'a>> {
        let youngest = self.youngest_rev()?;
        let revnum = match options.revision {
            None => youngest,
            Some(rev) if rev <= youngest => rev,
            Some(rev) => return Err(ReposError::NoSuchRevision(rev)),
        };
        let options = ReportOptions {
            fs_base: path::canonicalize(&options.fs_base),
            target: path::canonicalize_relative(&options.target),
            switch_path: options.switch_path.as_deref().map(path::canonicalize),
            ..options
        };
        Ok(Reporter {
            repos: self,
            editor,
            authz,
            cancel,
            options,
            revnum,
            youngest,
            entries: ReportMap::new(),
            state: ReportState::Open,
        })
    }
}

impl<'a> Reporter<'a> {
    pub fn target_revision(&self) -> Revnum {
        self.revnum
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ReportState::Open => Ok(()),
            _ => Err(ReposError::ReportAlreadyClosed),
        }
    }

    fn insert(&mut self, at: &str, info: PathInfo) -> Result<()> {
        self.ensure_open()?;
        let at = path::canonicalize_relative(at);
        if self.entries.is_empty() && !at.is_empty() {
            return Err(ReposError::protocol(format!(
                "first report entry must describe the report root, not '{}'",
                at
            )));
        }
        if let PathInfo::Present { rev, .. } = &info {
            if *rev > self.youngest {
                return Err(ReposError::NoSuchRevision(*rev));
            }
        }
        tracing::debug!("report {:?} -> {:?}", at, info);
        self.entries.insert(at, info);
        Ok(())
    }

    /// The working copy has `path` at `rev`.
    pub fn set_path(&mut self, at: &str, rev: Revnum, start_empty: bool, lock_token: Option<&str>) -> Result<()> {
        self.insert(
            at,
            PathInfo::Present {
                rev,
                link: None,
                start_empty,
                lock_token: lock_token.map(str::to_string),
            },
        )
    }

    /// The working copy has `path` switched to `link_target` at `rev`.
    pub fn link_path(
        &mut self,
        at: &str,
        link_target: &str,
        rev: Revnum,
        start_empty: bool,
        lock_token: Option<&str>,
    ) -> Result<()> {
        self.insert(
            at,
            PathInfo::Present {
                rev,
                link: Some(path::canonicalize(link_target)),
                start_empty,
                lock_token: lock_token.map(str::to_string),
            },
        )
    }

    /// The working copy lacks `path`.
    pub fn delete_path(&mut self, at: &str) -> Result<()> {
        if path::canonicalize_relative(at).is_empty() {
            self.ensure_open()?;
            return Err(ReposError::protocol("the report root cannot be deleted"));
        }
        self.insert(at, PathInfo::Deleted)
    }

    /// Drive the editor. A failed drive aborts the edit.
    pub fn finish_report(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = ReportState::Finished;
        if !self.entries.contains_key("") {
            return Err(ReposError::protocol("report has no root entry"));
        }

        let options = &self.options;
        let t_path = options
            .switch_path
            .clone()
            .unwrap_or_else(|| path::join(&options.fs_base, &options.target));
        let revision = self.repos.revision(self.revnum)?;
        let check = AccessCheck::new(self.authz, self.repos.name(), options.user.as_deref());
        let result = TreeDelta::new(
            self.repos.storage().as_ref(),
            &revision.root,
            &self.entries,
            check,
            self.cancel,
        )
        .text_deltas(options.text_deltas)
        .ignore_ancestry(options.ignore_ancestry)
        .drive(&mut *self.editor, self.revnum, &options.fs_base, &options.target, &t_path);

        match result {
            Ok(()) => {
                tracing::debug!("report against r{} finished ({} entries)", self.revnum, self.entries.len());
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self.editor.abort_edit() {
                    tracing::debug!("abort_edit after failed report: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Discard the report; the editor is never driven.
    pub fn abort_report(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = ReportState::Aborted;
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::editor::EditRecorder;
    use crate::hooks::NoHooks;
    use crate::types::never_cancel;

    fn repos() -> Repository {
        let repos = Repository::in_memory();
        let mut txn = repos.begin_txn_for_commit(None, Some("alice"), "init", &NoHooks).unwrap();
        txn.make_dir("/trunk").unwrap();
        txn.make_file("/trunk/a.txt").unwrap();
        txn.set_contents("/trunk/a.txt", "alpha\n").unwrap();
        txn.make_dir("/branches").unwrap();
        repos.commit(&mut txn, &NoHooks).unwrap();
        repos
    }

    #[test]
    fn test_closed_report_rejects_calls() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        let mut reporter = repos
            .begin_report(ReportOptions::default(), &mut rec, &AllowAll, &never_cancel)
            .unwrap();
        reporter.set_path("", 1, false, None).unwrap();
        reporter.finish_report().unwrap();
        assert!(matches!(reporter.set_path("x", 1, false, None), Err(ReposError::ReportAlreadyClosed)));
        assert!(matches!(reporter.finish_report(), Err(ReposError::ReportAlreadyClosed)));
        assert!(matches!(reporter.abort_report(), Err(ReposError::ReportAlreadyClosed)));
    }

    #[test]
    fn test_root_entry_comes_first() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        let mut reporter = repos
            .begin_report(ReportOptions::default(), &mut rec, &AllowAll, &never_cancel)
            .unwrap();
        assert!(matches!(
            reporter.set_path("trunk", 1, false, None),
            Err(ReposError::ProtocolViolation(_))
        ));
        assert!(matches!(reporter.delete_path(""), Err(ReposError::ProtocolViolation(_))));
        assert!(matches!(reporter.set_path("", 7, false, None), Err(ReposError::NoSuchRevision(7))));
    }

    #[test]
    fn test_finish_without_root_fails() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        {
            let mut reporter = repos
                .begin_report(ReportOptions::default(), &mut rec, &AllowAll, &never_cancel)
                .unwrap();
            assert!(matches!(reporter.finish_report(), Err(ReposError::ProtocolViolation(_))));
        }
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn test_abort_report_leaves_editor_untouched() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        {
            let mut reporter = repos
                .begin_report(ReportOptions::default(), &mut rec, &AllowAll, &never_cancel)
                .unwrap();
            reporter.set_path("", 0, false, None).unwrap();
            reporter.abort_report().unwrap();
            assert!(matches!(reporter.delete_path("a"), Err(ReposError::ReportAlreadyClosed)));
        }
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn test_update_single_target() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        {
            let options = ReportOptions {
                target: "trunk".into(),
                ..Default::default()
            };
            let mut reporter = repos.begin_report(options, &mut rec, &AllowAll, &never_cancel).unwrap();
            reporter.set_path("", 0, true, None).unwrap();
            reporter.finish_report().unwrap();
        }
        assert_eq!(rec.target_revision, Some(1));
        assert_eq!(
            rec.calls,
            vec![
                "open_root",
                "add_directory trunk",
                "add_file trunk/a.txt",
                "apply_text_delta trunk/a.txt",
                "close_file trunk/a.txt",
                "close_directory trunk",
                "close_directory ",
                "close_edit",
            ]
        );
    }

    #[test]
    fn test_failed_drive_aborts_edit() {
        let repos = repos();
        let mut rec = EditRecorder::new();
        let cancel = || true;
        {
            let mut reporter = repos
                .begin_report(ReportOptions::default(), &mut rec, &AllowAll, &cancel)
                .unwrap();
            reporter.set_path("", 0, false, None).unwrap();
            assert!(reporter.finish_report().unwrap_err().is_cancelled());
        }
        assert_eq!(rec.calls.last().map(String::as_str), Some("abort_edit"));
    }
}
