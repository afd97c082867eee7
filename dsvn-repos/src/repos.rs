//! Repository: revisions, transactions, commits, revision properties, locks
//!
//! Commits are two-phase. The pre-commit hook sees the transaction first;
//! then, under the repository's commit lock, the youngest revision is read,
//! every changed path is checked against it, the transaction's changes are
//! merged onto it when it moved since the transaction began, a revision
//! number is reserved and the new revision is published in one storage
//! write.

use crate::authz::{Access, AccessCheck, AllowAll, Authz, SvnAuthz};
use crate::config::ReposConfig;
use crate::error::{ReposError, Result};
use crate::hooks::Hooks;
use crate::path;
use crate::props::{PropertySet, format_svn_date, parse_svn_date, svn_props};
use crate::storage::{Lock, MemoryStore, Revision, SledStore, Storage};
use crate::tree::{ChangedPath, NodeRev, Tree};
use crate::txn::{Transaction, TxnKind, TxnRegistry};
use crate::types::{NodeAction, NodeKind, Revnum};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// How much of a revision a user may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionAccess {
    /// Every changed path is readable
    Full,
    /// Some changed paths are readable: only author and date are visible
    Partial,
    None,
}

/// Query for [`Repository::logs`]
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub paths: Vec<String>,
    pub start: Revnum,
    pub end: Revnum,
    /// Maximum number of entries; 0 for no limit
    pub limit: usize,
    pub discover_changed_paths: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            paths: vec!["/".to_string()],
            start: 0,
            end: 0,
            limit: 0,
            discover_changed_paths: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub rev: Revnum,
    pub author: Option<String>,
    pub date: Option<String>,
    pub message: Option<String>,
    /// Readable changed paths; empty unless requested
    pub changed_paths: Vec<ChangedPath>,
}

/// One interesting revision of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRev {
    pub path: String,
    pub rev: Revnum,
    pub rev_props: PropertySet,
    pub props: PropertySet,
    pub text: Bytes,
}

pub struct Repository {
    name: String,
    path: Option<PathBuf>,
    config: ReposConfig,
    storage: Arc<dyn Storage>,
    txns: TxnRegistry,
    commit_lock: Mutex<()>,
}

impl Repository {
    /// A repository held entirely in memory
    pub fn in_memory() -> Self {
        Self::with_storage(Arc::new(MemoryStore::new()), ReposConfig::default())
    }

    pub fn with_storage(storage: Arc<dyn Storage>, config: ReposConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: None,
            config,
            storage,
            txns: TxnRegistry::default(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Open the repository in `dir`, creating it if needed.
    ///
    /// Revisions live in a sled database under `dir/db`; the configuration
    /// is read from `dir/repos-config.json`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config = ReposConfig::load(dir)?;
        if !dir.join(crate::config::CONFIG_FILE).exists() {
            config.save(dir)?;
        }
        let storage = SledStore::open(dir.join("db"), config.cache_size)?;
        let mut repos = Self::with_storage(Arc::new(storage), config);
        repos.path = Some(dir.to_path_buf());
        tracing::info!("Opened repository {} at {}", repos.name, dir.display());
        Ok(repos)
    }

    /// Name passed to authorization predicates
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> &ReposConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The authz rules named by the configuration, or allow-all.
    pub fn load_authz(&self) -> Result<Box<dyn Authz>> {
        let configured = self
            .path
            .as_deref()
            .and_then(|dir| self.config.authz_path(dir))
            .or_else(|| self.config.authz_file.clone());
        match configured {
            Some(file) => Ok(Box::new(SvnAuthz::from_file(file)?)),
            None => Ok(Box::new(AllowAll)),
        }
    }

    pub fn uuid(&self) -> Result<String> {
        self.storage.uuid()
    }

    pub fn set_uuid(&self, uuid: &str) -> Result<()> {
        self.storage.set_uuid(uuid)
    }

    pub fn youngest_rev(&self) -> Result<Revnum> {
        self.storage.youngest()
    }

    pub fn revision(&self, rev: Revnum) -> Result<Arc<Revision>> {
        self.storage.read_revision(rev)
    }

    /// Tree of a published revision
    pub fn revision_root(&self, rev: Revnum) -> Result<Tree> {
        Ok(self.revision(rev)?.root.clone())
    }

    pub fn check_path(&self, rev: Revnum, at: &str) -> Result<NodeKind> {
        Ok(self.revision(rev)?.root.kind(&path::canonicalize(at)))
    }

    pub fn file_contents(&self, rev: Revnum, at: &str) -> Result<Bytes> {
        self.revision(rev)?.root.file_text(&path::canonicalize(at))
    }

    pub fn node_proplist(&self, rev: Revnum, at: &str) -> Result<PropertySet> {
        Ok(self.revision(rev)?.root.node(&path::canonicalize(at))?.props.clone())
    }

    fn resolve_base(&self, base: Option<Revnum>) -> Result<Revnum> {
        let youngest = self.youngest_rev()?;
        match base {
            None => Ok(youngest),
            Some(rev) if rev <= youngest => Ok(rev),
            Some(rev) => Err(ReposError::NoSuchRevision(rev)),
        }
    }

    fn begin_txn(&self, kind: TxnKind, base: Option<Revnum>) -> Result<Transaction> {
        let base_rev = self.resolve_base(base)?;
        let root = self.revision_root(base_rev)?;
        Transaction::begin(self.storage.clone(), self.txns.clone(), kind, base_rev, root)
    }

    /// Begin a transaction that will be committed.
    ///
    /// Runs the start-commit hook and records author and log message as
    /// transaction properties.
    pub fn begin_txn_for_commit(
        &self,
        base: Option<Revnum>,
        author: Option<&str>,
        log_message: &str,
        hooks: &dyn Hooks,
    ) -> Result<Transaction> {
        hooks.start_commit(author)?;
        let mut txn = self.begin_txn(TxnKind::Commit, base)?;
        if let Some(author) = author {
            txn.change_txn_prop(svn_props::REVISION_AUTHOR, Some(author))?;
        }
        txn.change_txn_prop(svn_props::REVISION_LOG, Some(log_message))?;
        Ok(txn)
    }

    /// Begin a scratch transaction for an update report; it cannot be
    /// committed.
    pub fn begin_txn_for_update(&self, base: Option<Revnum>, author: Option<&str>) -> Result<Transaction> {
        let mut txn = self.begin_txn(TxnKind::Update, base)?;
        if let Some(author) = author {
            txn.change_txn_prop(svn_props::REVISION_AUTHOR, Some(author))?;
        }
        Ok(txn)
    }

    /// Names of the open transactions
    pub fn open_transactions(&self) -> Vec<String> {
        self.txns
            .lock()
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish a transaction as a new revision.
    ///
    /// On `OutOfDate` the transaction stays open and can be retried after
    /// the conflicting paths are brought up to date.
    pub fn commit(&self, txn: &mut Transaction, hooks: &dyn Hooks) -> Result<Revnum> {
        txn.ensure_open()?;
        if txn.kind() == TxnKind::Update {
            return Err(ReposError::protocol(format!(
                "transaction {} was begun for an update and cannot be committed",
                txn.name()
            )));
        }
        let info = txn.info();
        hooks.pre_commit(&info)?;

        let rev = {
            let _guard = self
                .commit_lock
                .lock()
                .map_err(|_| ReposError::Storage("commit lock poisoned".to_string()))?;

            let changes = txn.changes();
            let youngest = self.storage.youngest()?;
            let head = self.storage.read_revision(youngest)?;
            let root = if youngest == txn.base_rev() {
                txn.root().clone()
            } else {
                let base = self.storage.read_revision(txn.base_rev())?;
                check_conflicts(&base, &head, &changes)?;
                merge_onto(&head, txn, &changes)?
            };
            self.check_locks(txn, &changes)?;

            let rev = self.storage.allocate_next_revision()?;
            let mut root = root;
            root.stamp(rev);
            let mut props = txn.props().clone();
            props.set(svn_props::REVISION_DATE, format_svn_date(&Utc::now()));
            let revision = Revision {
                rev,
                root,
                props,
                changes,
            };
            if let Err(e) = self.storage.write_revision(revision) {
                self.storage.release_revision(rev);
                return Err(e);
            }
            self.release_committed_locks(txn);
            rev
        };

        txn.close();
        tracing::info!(
            "Committed r{} ({} changed paths) from {}",
            rev,
            info.changes.len(),
            info.name
        );
        if let Err(e) = hooks.post_commit(rev, &info) {
            tracing::warn!("post-commit hook error (ignored): {}", e);
        }
        Ok(rev)
    }

    fn check_locks(&self, txn: &Transaction, changes: &[ChangedPath]) -> Result<()> {
        let author = txn.props().get(svn_props::REVISION_AUTHOR);
        for change in changes {
            let locks = match change.action {
                NodeAction::Delete | NodeAction::Replace => self.storage.locks_under(&change.path)?,
                _ => self.storage.get_lock(&change.path)?.into_iter().collect(),
            };
            for lock in locks {
                let token_ok = txn.lock_tokens().get(&lock.path) == Some(&lock.token);
                if !token_ok || author != Some(&lock.owner) {
                    return Err(ReposError::AccessDenied {
                        path: lock.path,
                        access: Access::Write,
                    });
                }
            }
        }
        Ok(())
    }

    fn release_committed_locks(&self, txn: &Transaction) {
        for (at, token) in txn.lock_tokens() {
            match self.storage.get_lock(at) {
                Ok(Some(lock)) if &lock.token == token => {
                    if let Err(e) = self.storage.remove_lock(at) {
                        tracing::warn!("Failed to release lock on {}: {}", at, e);
                    }
                }
                _ => {}
            }
        }
    }

    // ---- Revision properties ----

    /// How much of `rev` the user may see
    pub fn revision_access(&self, rev: Revnum, authz: &dyn Authz, user: Option<&str>) -> Result<RevisionAccess> {
        let revision = self.revision(rev)?;
        let check = AccessCheck::new(authz, &self.name, user);
        Ok(access_of(&revision, &check))
    }

    pub fn revision_proplist(&self, rev: Revnum, authz: &dyn Authz, user: Option<&str>) -> Result<PropertySet> {
        let revision = self.revision(rev)?;
        let check = AccessCheck::new(authz, &self.name, user);
        Ok(match access_of(&revision, &check) {
            RevisionAccess::Full => revision.props.clone(),
            RevisionAccess::Partial => revision
                .props
                .iter()
                .filter(|(k, _)| *k == svn_props::REVISION_AUTHOR || *k == svn_props::REVISION_DATE)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            RevisionAccess::None => PropertySet::new(),
        })
    }

    pub fn revision_prop(&self, rev: Revnum, name: &str, authz: &dyn Authz, user: Option<&str>) -> Result<Option<String>> {
        Ok(self.revision_proplist(rev, authz, user)?.get(name).cloned())
    }

    /// Set or delete a revision property.
    ///
    /// Requires full read access to the revision and the approval of the
    /// pre-revprop-change hook.
    pub fn change_rev_prop(
        &self,
        rev: Revnum,
        user: Option<&str>,
        name: &str,
        value: Option<&str>,
        authz: &dyn Authz,
        hooks: &dyn Hooks,
    ) -> Result<()> {
        let revision = self.revision(rev)?;
        let check = AccessCheck::new(authz, &self.name, user);
        if access_of(&revision, &check) != RevisionAccess::Full {
            return Err(ReposError::AccessDenied {
                path: format!("revision {}", rev),
                access: Access::Write,
            });
        }
        let action = match (revision.props.get(name), value) {
            (_, None) => 'D',
            (None, Some(_)) => 'A',
            (Some(_), Some(_)) => 'M',
        };
        hooks.pre_revprop_change(rev, user, name, action, value)?;

        let mut props = revision.props.clone();
        props.apply(name, value);
        self.storage.set_revision_props(rev, props)?;
        tracing::info!("Changed revision property {} on r{}", name, rev);

        if let Err(e) = hooks.post_revprop_change(rev, user, name, action) {
            tracing::warn!("post-revprop-change hook error (ignored): {}", e);
        }
        Ok(())
    }

    /// Install revision properties without access checks or hooks.
    pub(crate) fn set_revision_props(&self, rev: Revnum, props: PropertySet) -> Result<()> {
        self.storage.set_revision_props(rev, props)
    }

    // ---- History ----

    /// Revisions that touched any of `paths`, in the order `start` to `end`.
    pub fn logs(&self, options: &LogOptions, authz: &dyn Authz, user: Option<&str>) -> Result<Vec<LogEntry>> {
        let youngest = self.youngest_rev()?;
        for rev in [options.start, options.end] {
            if rev > youngest {
                return Err(ReposError::NoSuchRevision(rev));
            }
        }
        let revs: Box<dyn Iterator<Item = Revnum>> = if options.start <= options.end {
            Box::new(options.start..=options.end)
        } else {
            Box::new((options.end..=options.start).rev())
        };
        let paths: Vec<String> = options.paths.iter().map(|p| path::canonicalize(p)).collect();
        let check = AccessCheck::new(authz, &self.name, user);

        let mut entries = Vec::new();
        for rev in revs {
            let revision = self.revision(rev)?;
            let touches = paths.iter().any(|p| p == "/")
                || revision
                    .changes
                    .iter()
                    .any(|c| paths.iter().any(|p| path::is_ancestor(p, &c.path)));
            if !touches {
                continue;
            }
            let access = access_of(&revision, &check);
            if access == RevisionAccess::None {
                continue;
            }
            let props = &revision.props;
            entries.push(LogEntry {
                rev,
                author: props.get(svn_props::REVISION_AUTHOR).cloned(),
                date: props.get(svn_props::REVISION_DATE).cloned(),
                message: match access {
                    RevisionAccess::Full => props.get(svn_props::REVISION_LOG).cloned(),
                    _ => None,
                },
                changed_paths: if options.discover_changed_paths {
                    revision
                        .changes
                        .iter()
                        .filter(|c| check.can_read(&c.path))
                        .cloned()
                        .collect()
                } else {
                    Vec::new()
                },
            });
            if options.limit > 0 && entries.len() >= options.limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Youngest revision whose date is not after `when`.
    pub fn dated_revision(&self, when: DateTime<Utc>) -> Result<Revnum> {
        let date_of = |rev: Revnum| -> Result<Option<DateTime<Utc>>> {
            Ok(self
                .revision(rev)?
                .props
                .get(svn_props::REVISION_DATE)
                .and_then(|d| parse_svn_date(d)))
        };
        let (mut lo, mut hi) = (0, self.youngest_rev()?);
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            match date_of(mid)? {
                Some(d) if d > when => hi = mid - 1,
                _ => lo = mid,
            }
        }
        Ok(lo)
    }

    /// Revisions in `start..=end` in which the file at `at` changed.
    pub fn file_revs(
        &self,
        at: &str,
        start: Revnum,
        end: Revnum,
        authz: &dyn Authz,
        user: Option<&str>,
    ) -> Result<Vec<FileRev>> {
        let at = path::canonicalize(at);
        AccessCheck::new(authz, &self.name, user).require(&at, Access::Read)?;
        let (start, end) = (start.min(end), start.max(end));
        if end > self.youngest_rev()? {
            return Err(ReposError::NoSuchRevision(end));
        }

        let mut out = Vec::new();
        let mut last: Option<Revnum> = None;
        for rev in start..=end {
            let revision = self.revision(rev)?;
            let Some(node) = revision.root.get(&at) else {
                last = None;
                continue;
            };
            if node.is_dir() {
                return Err(ReposError::NotAFile(at));
            }
            if last != Some(node.created_rev) {
                last = Some(node.created_rev);
                out.push(FileRev {
                    path: at.clone(),
                    rev,
                    rev_props: revision.props.clone(),
                    props: node.props.clone(),
                    text: node.text().cloned().unwrap_or_default(),
                });
            }
        }
        Ok(out)
    }

    // ---- Locks ----

    /// Lock the file at `at` in the youngest revision.
    pub fn lock(&self, at: &str, owner: &str, comment: Option<&str>, steal: bool) -> Result<Lock> {
        let at = path::canonicalize(at);
        match self.check_path(self.youngest_rev()?, &at)? {
            NodeKind::File => {}
            NodeKind::None => return Err(ReposError::not_found(&at, "HEAD")),
            _ => return Err(ReposError::NotAFile(at)),
        }
        if let Some(existing) = self.storage.get_lock(&at)? {
            if !steal {
                return Err(ReposError::Locked {
                    path: at,
                    owner: existing.owner,
                });
            }
            tracing::info!("{} stole the lock on {} from {}", owner, at, existing.owner);
        }
        let lock = Lock {
            path: at,
            token: format!("opaquelocktoken:{}", uuid::Uuid::new_v4()),
            owner: owner.to_string(),
            comment: comment.map(str::to_string),
            created: Utc::now(),
        };
        self.storage.put_lock(lock.clone())?;
        Ok(lock)
    }

    /// Release a lock; `break_lock` skips the owner and token checks.
    pub fn unlock(&self, at: &str, token: Option<&str>, user: &str, break_lock: bool) -> Result<()> {
        let at = path::canonicalize(at);
        let lock = self
            .storage
            .get_lock(&at)?
            .ok_or_else(|| ReposError::not_found(&at, "lock table"))?;
        if !break_lock && (token != Some(lock.token.as_str()) || lock.owner != user) {
            return Err(ReposError::AccessDenied {
                path: at,
                access: Access::Write,
            });
        }
        self.storage.remove_lock(&at)
    }

    pub fn get_lock(&self, at: &str) -> Result<Option<Lock>> {
        self.storage.get_lock(&path::canonicalize(at))
    }

    /// Readable locks on `at` and beneath it
    pub fn get_locks(&self, at: &str, authz: &dyn Authz, user: Option<&str>) -> Result<Vec<Lock>> {
        let check = AccessCheck::new(authz, &self.name, user);
        Ok(self
            .storage
            .locks_under(&path::canonicalize(at))?
            .into_iter()
            .filter(|l| check.can_read(&l.path))
            .collect())
    }
}

fn access_of(revision: &Revision, check: &AccessCheck<'_>) -> RevisionAccess {
    if revision.changes.is_empty() {
        return RevisionAccess::Full;
    }
    let readable = revision
        .changes
        .iter()
        .filter(|c| check.can_read(&c.path))
        .count();
    if readable == revision.changes.len() {
        RevisionAccess::Full
    } else if readable > 0 {
        RevisionAccess::Partial
    } else {
        RevisionAccess::None
    }
}

/// Fail if any changed path was changed in `head` since `base`.
fn check_conflicts(base: &Revision, head: &Revision, changes: &[ChangedPath]) -> Result<()> {
    for change in changes {
        let dir_props_only = change.action == NodeAction::Modify && change.kind == NodeKind::Dir;
        let conflict = match (base.root.get(&change.path), head.root.get(&change.path)) {
            // Edits beneath a directory restamp it; only its own props matter here.
            (Some(b), Some(h)) if dir_props_only => {
                (!b.related(h) || b.props != h.props).then_some(h.created_rev)
            }
            (Some(b), Some(h)) if !b.same_version(h) => Some(h.created_rev),
            (Some(_), None) => Some(head.rev),
            (None, Some(h)) => Some(h.created_rev),
            _ => None,
        };
        if let Some(changed) = conflict {
            tracing::debug!("Out of date: {} (base r{}, head r{})", change.path, base.rev, head.rev);
            return Err(ReposError::OutOfDate {
                path: change.path.clone(),
                base: base.rev,
                changed,
            });
        }
    }
    Ok(())
}

/// Replay the transaction's changes onto the head tree.
fn merge_onto(head: &Revision, txn: &Transaction, changes: &[ChangedPath]) -> Result<Tree> {
    let mut tree = head.root.clone();
    let out_of_date = |at: &str| ReposError::OutOfDate {
        path: at.to_string(),
        base: txn.base_rev(),
        changed: head.rev,
    };
    for change in changes {
        let at = change.path.as_str();
        match change.action {
            NodeAction::Delete => {
                tree.remove(at).map_err(|_| out_of_date(at))?;
            }
            NodeAction::Add | NodeAction::Replace => {
                if change.action == NodeAction::Replace {
                    tree.remove(at).map_err(|_| out_of_date(at))?;
                }
                let node = txn.root().node(at)?.clone();
                tree.put(at, node).map_err(|_| out_of_date(at))?;
            }
            NodeAction::Modify => {
                let node = txn.root().node(at)?;
                if node.is_dir() {
                    let props = node.props.clone();
                    let target: &mut NodeRev = tree.node_mut(at).map_err(|_| out_of_date(at))?;
                    target.props = props;
                } else {
                    tree.put(at, node.clone()).map_err(|_| out_of_date(at))?;
                }
            }
        }
    }
    Ok(tree)
}
