//! History queries and on-disk repositories

mod common;

use chrono::{TimeZone, Utc};
use common::{commit_text, init_tracing, project};
use dsvn_repos::{Access, AllowAll, LogOptions, NodeAction, Repository, RevisionAccess, svn_props};
use tempfile::TempDir;

#[test]
fn test_logs_filter_and_order() {
    let repos = project();

    let trunk = LogOptions {
        paths: vec!["/trunk".to_string()],
        start: 5,
        end: 1,
        ..Default::default()
    };
    let entries = repos.logs(&trunk, &AllowAll, None).unwrap();
    let revs: Vec<_> = entries.iter().map(|e| e.rev).collect();
    assert_eq!(revs, vec![4, 1]);
    assert_eq!(entries[0].message.as_deref(), Some("Tweak trunk"));
    assert!(entries[0].changed_paths.is_empty());

    let limited = LogOptions {
        start: 1,
        end: 5,
        limit: 2,
        discover_changed_paths: true,
        ..Default::default()
    };
    let entries = repos.logs(&limited, &AllowAll, None).unwrap();
    assert_eq!(entries.iter().map(|e| e.rev).collect::<Vec<_>>(), vec![1, 2]);
    let copy = &entries[1].changed_paths[0];
    assert_eq!(copy.path, "/branches/b1");
    assert_eq!(copy.action, NodeAction::Add);
    assert_eq!(copy.copy_from.as_ref().map(|c| c.rev), Some(1));

    let too_far = LogOptions {
        end: 9,
        ..Default::default()
    };
    assert!(repos.logs(&too_far, &AllowAll, None).is_err());
}

#[test]
fn test_partial_revisions_hide_the_message() {
    let repos = project();
    let no_src = |_: &str, p: &str, _: Option<&str>, _: Access| !p.starts_with("/trunk/src");

    assert_eq!(repos.revision_access(4, &no_src, Some("bob")).unwrap(), RevisionAccess::Partial);
    let props = repos.revision_proplist(4, &no_src, Some("bob")).unwrap();
    assert!(props.get(svn_props::REVISION_AUTHOR).is_some());
    assert!(props.get(svn_props::REVISION_DATE).is_some());
    assert!(props.get(svn_props::REVISION_LOG).is_none());

    let options = LogOptions {
        start: 4,
        end: 4,
        discover_changed_paths: true,
        ..Default::default()
    };
    let entry = &repos.logs(&options, &no_src, Some("bob")).unwrap()[0];
    assert_eq!(entry.message, None);
    assert_eq!(entry.changed_paths.len(), 1);
    assert_eq!(entry.changed_paths[0].path, "/trunk/a.txt");

    let only_src = |_: &str, p: &str, _: Option<&str>, _: Access| p == "/" || p.starts_with("/trunk/src");
    assert_eq!(repos.revision_access(3, &only_src, None).unwrap(), RevisionAccess::None);
    assert!(repos.revision_proplist(3, &only_src, None).unwrap().is_empty());
}

#[test]
fn test_dated_revision_bounds() {
    let repos = project();
    let long_ago = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(repos.dated_revision(long_ago).unwrap(), 0);
    assert_eq!(repos.dated_revision(Utc::now()).unwrap(), 5);
}

#[test]
fn test_file_revs_follow_changes() {
    let repos = project();
    let revs = repos.file_revs("/trunk/a.txt", 1, 5, &AllowAll, None).unwrap();
    assert_eq!(revs.iter().map(|r| r.rev).collect::<Vec<_>>(), vec![1, 4]);
    assert_eq!(revs[1].text.as_ref(), b"alpha\nmore\n");
}

#[test]
fn test_on_disk_repository_survives_reopen() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let uuid;
    {
        let repos = Repository::open(tmp.path()).unwrap();
        uuid = repos.uuid().unwrap();
        commit_text(&repos, "alice", "/a.txt", "one\n");
        commit_text(&repos, "alice", "/a.txt", "two\n");
        repos.lock("/a.txt", "alice", Some("mine"), false).unwrap();
    }
    assert!(tmp.path().join("repos-config.json").exists());

    let repos = Repository::open(tmp.path()).unwrap();
    assert_eq!(repos.uuid().unwrap(), uuid);
    assert_eq!(repos.youngest_rev().unwrap(), 2);
    assert_eq!(repos.file_contents(1, "/a.txt").unwrap().as_ref(), b"one\n");
    assert_eq!(repos.file_contents(2, "/a.txt").unwrap().as_ref(), b"two\n");
    assert_eq!(repos.get_lock("/a.txt").unwrap().unwrap().owner, "alice");
    assert_eq!(repos.path(), Some(tmp.path()));
}
