//! Repository hooks
//!
//! The repository calls a [`Hooks`] implementation around commits and
//! revision-property changes. Pre-hooks can reject the operation; errors
//! from post-hooks are logged and ignored because the change is already
//! published.
//!
//! [`ScriptHooks`] runs executable scripts from `<repo>/hooks/`, passing the
//! event on stdin. A missing script allows the operation.

use crate::error::{ReposError, Result};
use crate::tree::ChangedPath;
use crate::types::Revnum;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What a commit hook sees of a transaction
#[derive(Debug, Clone, Default)]
pub struct TxnInfo {
    pub name: String,
    pub base_rev: Revnum,
    pub author: Option<String>,
    pub log: Option<String>,
    pub changes: Vec<ChangedPath>,
}

/// Hook callbacks; every method defaults to allowing the operation
pub trait Hooks: Send + Sync {
    fn start_commit(&self, _user: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn pre_commit(&self, _txn: &TxnInfo) -> Result<()> {
        Ok(())
    }

    fn post_commit(&self, _rev: Revnum, _txn: &TxnInfo) -> Result<()> {
        Ok(())
    }

    /// `action` is `'A'`, `'M'` or `'D'`
    fn pre_revprop_change(
        &self,
        _rev: Revnum,
        _user: Option<&str>,
        _name: &str,
        _action: char,
        _value: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    fn post_revprop_change(&self, _rev: Revnum, _user: Option<&str>, _name: &str, _action: char) -> Result<()> {
        Ok(())
    }
}

/// Allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Runs hook scripts from a repository's `hooks/` directory.
pub struct ScriptHooks {
    hooks_dir: PathBuf,
}

impl ScriptHooks {
    /// Hooks are expected in `<repo_root>/hooks/`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: repo_path.into().join("hooks"),
        }
    }

    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(name)
    }

    pub fn ensure_hooks_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hooks_dir)?;
        Ok(())
    }

    /// Execute a hook script with `stdin_data` on its stdin.
    fn run_hook(&self, name: &str, stdin_data: &str) -> Result<()> {
        let hook_path = self.hook_path(name);
        if !hook_path.exists() {
            return Ok(());
        }
        let failed = |message: String| ReposError::HookFailed {
            hook: name.to_string(),
            message,
        };

        let mut child = Command::new(&hook_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("DSVN_REPO", self.hooks_dir.parent().unwrap_or(Path::new(".")))
            .spawn()
            .map_err(|e| failed(format!("failed to execute: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook may exit without reading its input.
            let _ = stdin.write_all(stdin_data.as_bytes());
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("failed to wait: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        };
        Err(failed(msg))
    }

    fn txn_payload(txn: &TxnInfo) -> String {
        let mut data = String::new();
        data.push_str(&format!("TXN: {}\n", txn.name));
        data.push_str(&format!("BASE: {}\n", txn.base_rev));
        data.push_str(&format!("AUTHOR: {}\n", txn.author.as_deref().unwrap_or("")));
        data.push_str(&format!("LOG: {}\n", txn.log.as_deref().unwrap_or("").replace('\n', " ")));
        data.push_str("FILES:\n");
        for change in &txn.changes {
            data.push_str(&format!("{} {}\n", change.action.code(), change.path));
        }
        data
    }
}

impl Hooks for ScriptHooks {
    fn start_commit(&self, user: Option<&str>) -> Result<()> {
        self.run_hook("start-commit", &format!("AUTHOR: {}\n", user.unwrap_or("")))
    }

    fn pre_commit(&self, txn: &TxnInfo) -> Result<()> {
        self.run_hook("pre-commit", &Self::txn_payload(txn))
    }

    fn post_commit(&self, rev: Revnum, txn: &TxnInfo) -> Result<()> {
        let data = format!("REVISION: {}\n{}", rev, Self::txn_payload(txn));
        self.run_hook("post-commit", &data)
    }

    fn pre_revprop_change(
        &self,
        rev: Revnum,
        user: Option<&str>,
        name: &str,
        action: char,
        value: Option<&str>,
    ) -> Result<()> {
        let mut data = String::new();
        data.push_str(&format!("REVISION: {}\n", rev));
        data.push_str(&format!("AUTHOR: {}\n", user.unwrap_or("")));
        data.push_str(&format!("PROPNAME: {}\n", name));
        data.push_str(&format!("ACTION: {}\n", action));
        data.push_str(&format!("VALUE: {}\n", value.unwrap_or("")));
        self.run_hook("pre-revprop-change", &data)
    }

    fn post_revprop_change(&self, rev: Revnum, user: Option<&str>, name: &str, action: char) -> Result<()> {
        let mut data = String::new();
        data.push_str(&format!("REVISION: {}\n", rev));
        data.push_str(&format!("AUTHOR: {}\n", user.unwrap_or("")));
        data.push_str(&format!("PROPNAME: {}\n", name));
        data.push_str(&format!("ACTION: {}\n", action));
        self.run_hook("post-revprop-change", &data)
    }
}
