//! Path-based authorization
//!
//! The repository never caches decisions: every editor call, report entry and
//! revision-property access asks the predicate again.
//!
//! [`SvnAuthz`] reads Subversion-style authz files:
//!
//! ```text
//! [groups]
//! developers = alice, bob
//! admins = charlie, @developers
//!
//! [/]
//! * = r
//! @admins = rw
//!
//! [projects:/private]
//! ~@admins =
//! $authenticated = r
//! ```

use crate::error::{ReposError, Result};
use crate::path;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// Kind of access being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Write => f.write_str("write"),
        }
    }
}

/// Authorization predicate
///
/// Any `Fn(repos_name, path, user, access) -> bool` closure is an `Authz`.
pub trait Authz: Send + Sync {
    fn can_access(&self, repos_name: &str, path: &str, user: Option<&str>, access: Access) -> bool;
}

impl<F> Authz for F
where
    F: Fn(&str, &str, Option<&str>, Access) -> bool + Send + Sync,
{
    fn can_access(&self, repos_name: &str, path: &str, user: Option<&str>, access: Access) -> bool {
        self(repos_name, path, user, access)
    }
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authz for AllowAll {
    fn can_access(&self, _: &str, _: &str, _: Option<&str>, _: Access) -> bool {
        true
    }
}

/// Denies everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authz for DenyAll {
    fn can_access(&self, _: &str, _: &str, _: Option<&str>, _: Access) -> bool {
        false
    }
}

/// An authz predicate bound to one repository and one user
#[derive(Clone, Copy)]
pub struct AccessCheck<'a> {
    authz: &'a dyn Authz,
    repos_name: &'a str,
    user: Option<&'a str>,
}

impl<'a> AccessCheck<'a> {
    pub fn new(authz: &'a dyn Authz, repos_name: &'a str, user: Option<&'a str>) -> Self {
        Self {
            authz,
            repos_name,
            user,
        }
    }

    pub fn user(&self) -> Option<&'a str> {
        self.user
    }

    pub fn allows(&self, path: &str, access: Access) -> bool {
        self.authz.can_access(self.repos_name, path, self.user, access)
    }

    pub fn can_read(&self, path: &str) -> bool {
        self.allows(path, Access::Read)
    }

    pub fn require(&self, path: &str, access: Access) -> Result<()> {
        if self.allows(path, access) {
            Ok(())
        } else {
            Err(ReposError::AccessDenied {
                path: path.to_string(),
                access,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Grant {
    read: bool,
    write: bool,
}

impl Grant {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" => Some(Grant::default()),
            "r" => Some(Grant {
                read: true,
                write: false,
            }),
            "rw" | "wr" => Some(Grant {
                read: true,
                write: true,
            }),
            _ => None,
        }
    }

    fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    Everyone,
    Anonymous,
    Authenticated,
    Group(String),
    User(String),
}

#[derive(Debug, Clone)]
struct Rule {
    subject: Subject,
    inverted: bool,
    grant: Grant,
}

/// Rules of one `[repos:/path]` or `[/path]` section
#[derive(Debug, Clone, Default)]
struct Section {
    rules: Vec<Rule>,
}

/// Subversion-style authz file
///
/// The most specific section with a rule matching the user decides; a
/// section naming the repository beats a generic one for the same path.
/// Paths with no matching rule at all are denied.
#[derive(Debug, Clone, Default)]
pub struct SvnAuthz {
    groups: HashMap<String, Vec<String>>,
    /// Keyed by (repository name or "", canonical path)
    sections: HashMap<(String, String), Section>,
}

impl SvnAuthz {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ReposError::Config(format!(
                "Failed to read authz file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut authz = SvnAuthz::default();
        let mut current: Option<(String, String)> = None;
        let mut in_groups = false;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let bad = |what: &str| ReposError::Config(format!("authz line {}: {}", lineno + 1, what));

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_groups = name == "groups";
                current = if in_groups {
                    None
                } else {
                    let (repos, p) = match name.split_once(':') {
                        Some((repos, p)) => (repos.to_string(), p),
                        None => (String::new(), name),
                    };
                    if !p.starts_with('/') {
                        return Err(bad("section path must be absolute"));
                    }
                    let key = (repos, path::canonicalize(p));
                    authz.sections.entry(key.clone()).or_default();
                    Some(key)
                };
                continue;
            }

            let (lhs, rhs) = line.split_once('=').ok_or_else(|| bad("expected 'name = value'"))?;
            let lhs = lhs.trim();
            if in_groups {
                let members = rhs
                    .split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect();
                authz.groups.insert(lhs.to_string(), members);
                continue;
            }

            let key = current.as_ref().ok_or_else(|| bad("rule outside of a section"))?;
            let (inverted, name) = match lhs.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, lhs),
            };
            let subject = match name {
                "*" => Subject::Everyone,
                "$anonymous" => Subject::Anonymous,
                "$authenticated" => Subject::Authenticated,
                _ => match name.strip_prefix('@') {
                    Some(group) => Subject::Group(group.to_string()),
                    None => Subject::User(name.to_string()),
                },
            };
            if inverted && subject == Subject::Everyone {
                return Err(bad("'~*' matches nobody"));
            }
            let grant = Grant::parse(rhs).ok_or_else(|| bad("access must be '', 'r' or 'rw'"))?;
            if let Some(section) = authz.sections.get_mut(key) {
                section.rules.push(Rule {
                    subject,
                    inverted,
                    grant,
                });
            }
        }

        for group in authz.groups.keys() {
            for member in &authz.groups[group] {
                if let Some(nested) = member.strip_prefix('@') {
                    if !authz.groups.contains_key(nested) {
                        return Err(ReposError::Config(format!(
                            "group '{}' references undefined group '{}'",
                            group, nested
                        )));
                    }
                }
            }
        }
        Ok(authz)
    }

    fn in_group(&self, group: &str, user: &str, seen: &mut HashSet<String>) -> bool {
        if !seen.insert(group.to_string()) {
            return false;
        }
        self.groups.get(group).is_some_and(|members| {
            members.iter().any(|m| match m.strip_prefix('@') {
                Some(nested) => self.in_group(nested, user, seen),
                None => m == user,
            })
        })
    }

    fn matches(&self, rule: &Rule, user: Option<&str>) -> bool {
        let hit = match (&rule.subject, user) {
            (Subject::Everyone, _) => true,
            (Subject::Anonymous, u) => u.is_none(),
            (Subject::Authenticated, u) => u.is_some(),
            (Subject::User(name), Some(u)) => name == u,
            (Subject::Group(g), Some(u)) => self.in_group(g, u, &mut HashSet::new()),
            (_, None) => false,
        };
        hit != rule.inverted
    }

    /// Union of the grants of all matching rules, if any rule matches.
    fn section_grant(&self, repos: &str, at: &str, user: Option<&str>) -> Option<Grant> {
        let section = self.sections.get(&(repos.to_string(), at.to_string()))?;
        let mut grant: Option<Grant> = None;
        for rule in section.rules.iter().filter(|r| self.matches(r, user)) {
            let g = grant.get_or_insert_with(Grant::default);
            g.read |= rule.grant.read;
            g.write |= rule.grant.write;
        }
        grant
    }

    fn grant_for(&self, repos_name: &str, path: &str, user: Option<&str>) -> Grant {
        let mut at = path::canonicalize(path);
        loop {
            if let Some(g) = self.section_grant(repos_name, &at, user) {
                return g;
            }
            if let Some(g) = self.section_grant("", &at, user) {
                return g;
            }
            if at == "/" {
                return Grant::default();
            }
            at = path::dirname(&at).to_string();
        }
    }
}

impl Authz for SvnAuthz {
    fn can_access(&self, repos_name: &str, path: &str, user: Option<&str>, access: Access) -> bool {
        self.grant_for(repos_name, path, user).allows(access)
    }
}
