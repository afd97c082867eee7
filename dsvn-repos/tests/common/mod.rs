//! Shared fixtures for the integration tests

#![allow(dead_code)]

use dsvn_repos::{CopyFrom, NoHooks, Repository, Revnum};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Commit one file edit, creating the file when needed.
pub fn commit_text(repos: &Repository, author: &str, at: &str, text: &str) -> Revnum {
    let mut txn = repos.begin_txn_for_commit(None, Some(author), "edit", &NoHooks).unwrap();
    if txn.root().get(at).is_none() {
        txn.make_file(at).unwrap();
    }
    txn.set_contents(at, text.to_string()).unwrap();
    repos.commit(&mut txn, &NoHooks).unwrap()
}

/// r1 lays out a small project, r2 branches it, r3 edits the branch,
/// r4 edits trunk and sets a property, r5 removes a file.
pub fn project() -> Repository {
    let repos = Repository::in_memory();

    let mut txn = repos.begin_txn_for_commit(None, Some("alice"), "Initial import", &NoHooks).unwrap();
    txn.make_dir("/trunk").unwrap();
    txn.make_dir("/trunk/src").unwrap();
    txn.make_file("/trunk/a.txt").unwrap();
    txn.set_contents("/trunk/a.txt", "alpha\n").unwrap();
    txn.make_file("/trunk/src/main.rs").unwrap();
    txn.set_contents("/trunk/src/main.rs", "fn main() {}\n").unwrap();
    txn.make_dir("/branches").unwrap();
    repos.commit(&mut txn, &NoHooks).unwrap();

    let mut txn = repos.begin_txn_for_commit(None, Some("bob"), "Branch", &NoHooks).unwrap();
    txn.copy(&CopyFrom::new("/trunk", 1), "/branches/b1").unwrap();
    repos.commit(&mut txn, &NoHooks).unwrap();

    commit_text(&repos, "bob", "/branches/b1/a.txt", "beta\n");

    let mut txn = repos.begin_txn_for_commit(None, Some("alice"), "Tweak trunk", &NoHooks).unwrap();
    txn.set_contents("/trunk/a.txt", "alpha\nmore\n").unwrap();
    txn.change_node_prop("/trunk/src", "svn:ignore", Some("target\n")).unwrap();
    repos.commit(&mut txn, &NoHooks).unwrap();

    let mut txn = repos.begin_txn_for_commit(None, Some("carol"), "Drop main", &NoHooks).unwrap();
    txn.delete("/branches/b1/src/main.rs").unwrap();
    repos.commit(&mut txn, &NoHooks).unwrap();

    assert_eq!(repos.youngest_rev().unwrap(), 5);
    repos
}
