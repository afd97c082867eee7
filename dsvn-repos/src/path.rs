//! Repository path helpers
//!
//! Repository paths are absolute, `/`-separated and never carry a trailing
//! slash; the root is `/`. Report paths and editor entry names are relative.

use std::cmp::Ordering;

/// Canonicalize an absolute repository path.
///
/// Collapses repeated separators, drops `.` components and any trailing
/// slash, and guarantees a leading `/`.
pub fn canonicalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Canonicalize a relative path (no leading slash, `""` for the anchor).
pub fn canonicalize_relative(path: &str) -> String {
    let canon = canonicalize(path);
    canon.trim_start_matches('/').to_string()
}

/// Join a path and a relative component.
pub fn join(base: &str, rel: &str) -> String {
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return rel.to_string();
    }
    if base == "/" {
        return format!("/{}", rel);
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

/// Parent of a path; the root (and `""`) is its own parent.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Final component of a path; empty for the root.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// True if `ancestor` is `path` or one of its ancestors.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    skip_ancestor(ancestor, path).is_some()
}

/// `path` relative to `ancestor`, or `None` if it is not underneath it.
pub fn skip_ancestor<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if ancestor == "/" || ancestor.is_empty() {
        return Some(path.trim_start_matches('/'));
    }
    let rest = path.strip_prefix(ancestor)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// True if `name` is usable as a single directory entry name.
pub fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Component-wise ordering, so that parents sort before their children.
pub fn compare(a: &str, b: &str) -> Ordering {
    components(a).cmp(components(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("trunk//src/"), "/trunk/src");
        assert_eq!(canonicalize("/./a/./b"), "/a/b");
        assert_eq!(canonicalize_relative("/a/b/"), "a/b");
        assert_eq!(canonicalize_relative("/"), "");
    }

    #[test]
    fn test_join_dirname_basename() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b/c"), "/a/b/c");
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("x", ""), "x");
        assert_eq!(dirname("/a/b"), "/a");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("a"), "");
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn test_skip_ancestor() {
        assert_eq!(skip_ancestor("/a", "/a/b/c"), Some("b/c"));
        assert_eq!(skip_ancestor("/a", "/a"), Some(""));
        assert_eq!(skip_ancestor("/a", "/ab"), None);
        assert_eq!(skip_ancestor("/", "/x"), Some("x"));
        assert!(is_ancestor("/secret", "/secret/plans.txt"));
        assert!(!is_ancestor("/secret", "/secretary"));
    }

    #[test]
    fn test_compare_parents_first() {
        let mut paths = vec!["/a/b", "/a-b", "/a", "/"];
        paths.sort_by(|a, b| compare(a, b));
        assert_eq!(paths, vec!["/", "/a", "/a/b", "/a-b"]);
    }
}
