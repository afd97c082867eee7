//! Dump and load across repositories

mod common;

use common::{init_tracing, project};
use std::cell::Cell;
use dsvn_repos::{
    DumpOptions, DumpReader, DumpRecord, LoadOptions, NoHooks, Repository, ReposError, UuidAction, dump_fs,
    load_fs, never_cancel, svn_props,
};

fn dump(repos: &Repository, options: &DumpOptions) -> Vec<u8> {
    let mut out = Vec::new();
    dump_fs(repos, &mut out, options, &never_cancel, &mut |_| {}).unwrap();
    out
}

#[test]
fn test_dump_load_dump_is_stable() {
    init_tracing();
    let source = project();
    for use_deltas in [false, true] {
        let options = DumpOptions {
            use_deltas,
            ..Default::default()
        };
        let first = dump(&source, &options);

        let target = Repository::in_memory();
        let mut lines = Vec::new();
        let stats = load_fs(
            &target,
            &first[..],
            &LoadOptions::default(),
            &NoHooks,
            &never_cancel,
            &mut |line| lines.push(line.to_string()),
        )
        .unwrap();
        assert_eq!(stats.revisions, 5);
        assert_eq!(target.uuid().unwrap(), source.uuid().unwrap());
        assert!(lines.iter().any(|l| l == "------- Committed revision 5 >>>"));

        for rev in 1..=5 {
            let (a, b) = (source.revision(rev).unwrap(), target.revision(rev).unwrap());
            assert_eq!(a.root.flatten(), b.root.flatten(), "tree of r{}", rev);
            assert_eq!(a.props, b.props, "revprops of r{}", rev);
        }

        let second = dump(&target, &options);
        assert_eq!(
            String::from_utf8_lossy(&first),
            String::from_utf8_lossy(&second),
            "use_deltas = {}",
            use_deltas
        );
    }
}

#[test]
fn test_incremental_dumps_chain() {
    let source = project();
    let head = dump(
        &source,
        &DumpOptions {
            end: Some(2),
            ..Default::default()
        },
    );
    let tail = dump(
        &source,
        &DumpOptions {
            start: 3,
            incremental: true,
            ..Default::default()
        },
    );
    assert!(!String::from_utf8_lossy(&tail).contains("UUID:"));

    let target = Repository::in_memory();
    for stream in [&head, &tail] {
        load_fs(&target, &stream[..], &LoadOptions::default(), &NoHooks, &never_cancel, &mut |_| {}).unwrap();
    }
    assert_eq!(target.youngest_rev().unwrap(), 5);
    assert_eq!(target.uuid().unwrap(), source.uuid().unwrap());
    assert_eq!(
        target.revision(5).unwrap().root.flatten(),
        source.revision(5).unwrap().root.flatten()
    );
}

#[test]
fn test_uuid_actions() {
    let source = project();
    let stream = dump(&source, &DumpOptions::default());

    let target = Repository::in_memory();
    let original = target.uuid().unwrap();
    let ignore = LoadOptions {
        uuid_action: UuidAction::Ignore,
        ..Default::default()
    };
    load_fs(&target, &stream[..], &ignore, &NoHooks, &never_cancel, &mut |_| {}).unwrap();
    assert_eq!(target.uuid().unwrap(), original);

    let mut txn = target.begin_txn_for_commit(None, Some("admin"), "mkdir", &NoHooks).unwrap();
    txn.make_dir("/again").unwrap();
    txn.make_dir("/forced").unwrap();
    target.commit(&mut txn, &NoHooks).unwrap();

    // The repository is no longer empty, so the default leaves the UUID alone.
    let again = LoadOptions {
        parent_dir: Some("/again".to_string()),
        ..Default::default()
    };
    let stats = load_fs(&target, &stream[..], &again, &NoHooks, &never_cancel, &mut |_| {}).unwrap();
    assert_eq!(target.uuid().unwrap(), original);
    assert_eq!(stats.revision_map.get(&5), Some(&11));
    assert_eq!(
        target.file_contents(11, "/again/trunk/a.txt").unwrap().as_ref(),
        b"alpha\nmore\n"
    );
    assert_eq!(target.check_path(11, "/again/branches/b1/src/main.rs").unwrap(), dsvn_repos::NodeKind::None);

    let force = LoadOptions {
        uuid_action: UuidAction::Force,
        parent_dir: Some("/forced".to_string()),
        ..Default::default()
    };
    load_fs(&target, &stream[..], &force, &NoHooks, &never_cancel, &mut |_| {}).unwrap();
    assert_eq!(target.uuid().unwrap(), source.uuid().unwrap());
    assert_eq!(target.youngest_rev().unwrap(), 16);
}

#[test]
fn test_reader_sees_every_revision() {
    let source = project();
    let stream = dump(&source, &DumpOptions::default());
    let mut revisions = Vec::new();
    let mut nodes = 0;
    for record in DumpReader::new(&stream[..]) {
        match record.unwrap() {
            DumpRecord::Revision(r) => {
                if r.revision > 0 {
                    assert!(r.props.get(svn_props::REVISION_AUTHOR).is_some());
                }
                revisions.push(r.revision);
            }
            DumpRecord::Node(_) => nodes += 1,
            _ => {}
        }
    }
    assert_eq!(revisions, vec![0, 1, 2, 3, 4, 5]);
    assert!(nodes >= 9);
}

#[test]
fn test_truncated_stream_keeps_complete_revisions() {
    init_tracing();
    let source = project();
    let stream = dump(&source, &DumpOptions::default());
    let text = String::from_utf8_lossy(&stream).into_owned();
    // Cut three bytes into the content of the first node of r4.
    let rev4 = text.find("Revision-number: 4").unwrap();
    let node = rev4 + text[rev4..].find("Node-path:").unwrap();
    let cut = node + text[node..].find("\n\n").unwrap() + 2 + 3;

    let target = Repository::in_memory();
    let err = load_fs(
        &target,
        &stream[..cut],
        &LoadOptions::default(),
        &NoHooks,
        &never_cancel,
        &mut |_| {},
    )
    .unwrap_err();
    assert!(matches!(err, ReposError::MalformedStream { .. }), "{:?}", err);
    assert_eq!(target.youngest_rev().unwrap(), 3);
    assert!(target.open_transactions().is_empty());
}

#[test]
fn test_cancelled_dump_loads_only_complete_revisions() {
    init_tracing();
    let source = project();
    let dumped = Cell::new(0);
    let polls = Cell::new(0);
    let cancel = || {
        polls.set(polls.get() + 1);
        dumped.get() >= 4 && polls.get() >= 2
    };
    let mut stream = Vec::new();
    let err = dump_fs(&source, &mut stream, &DumpOptions::default(), &cancel, &mut |_| {
        dumped.set(dumped.get() + 1);
        polls.set(0);
    })
    .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!String::from_utf8_lossy(&stream).contains("Revision-number: 4"));

    let target = Repository::in_memory();
    let stats = load_fs(&target, &stream[..], &LoadOptions::default(), &NoHooks, &never_cancel, &mut |_| {}).unwrap();
    assert_eq!(stats.revisions, 3);
    assert_eq!(target.youngest_rev().unwrap(), 3);
    assert_eq!(
        target.revision(3).unwrap().root.flatten(),
        source.revision(3).unwrap().root.flatten()
    );
}
