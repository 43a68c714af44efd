//! Smoke tests for stratum-store-db.
//!
//! Exercises the engine the way the local store uses it: a file-backed
//! database, several tables, and interleaved scalar/list/timestamped
//! writes under transactions.

use stratum_store_db::{
    merge_db_key, query_state_reference_list, set_state_reference_list, set_state_revisions, Db,
    ReadTxn as _, RevisionClosure, Snapshots,
};

#[test]
fn file_backed_database_persists_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("store.sqlite");

    {
        let mut db = Db::open(&db_path).unwrap();
        let valid = db.open_table("validpaths").unwrap();
        let txn = db.transaction().unwrap();
        txn.put_string(valid, "/store/aaa-hello", "sha256:00").unwrap();
        txn.commit().unwrap();
    }

    let mut db = Db::open(&db_path).unwrap();
    let valid = db.open_table("validpaths").unwrap();
    assert_eq!(
        db.get_string(valid, "/store/aaa-hello").unwrap().as_deref(),
        Some("sha256:00")
    );
}

#[test]
fn multiple_tables_are_independent() {
    let mut db = Db::open_memory().unwrap();
    let valid = db.open_table("validpaths").unwrap();
    let derivers = db.open_table("derivers").unwrap();

    let txn = db.transaction().unwrap();
    txn.put_string(valid, "k", "v1").unwrap();
    txn.put_string(derivers, "k", "v2").unwrap();
    txn.commit().unwrap();

    assert_eq!(db.get_string(valid, "k").unwrap().as_deref(), Some("v1"));
    assert_eq!(db.get_string(derivers, "k").unwrap().as_deref(), Some("v2"));
}

/// A transaction either lands entirely or not at all.
#[test]
fn transaction_atomicity_across_tables() {
    let mut db = Db::open_memory().unwrap();
    let valid = db.open_table("validpaths").unwrap();
    let refs = db.open_table("references").unwrap();

    {
        let txn = db.transaction().unwrap();
        txn.put_string(valid, "/store/aaa-x", "sha256:ff").unwrap();
        txn.put_list(refs, "/store/aaa-x", &["/store/bbb-y"]).unwrap();
        // dropped without commit
    }
    assert!(!db.contains(valid, "/store/aaa-x").unwrap());
    assert!(db.get_list(refs, "/store/aaa-x").unwrap().is_empty());
}

/// Revision-pinned state references behave as a history, end to end.
#[test]
fn state_reference_history() {
    let mut db = Db::open_memory().unwrap();
    let revs = db.open_table("staterevisions").unwrap();
    let comments = db.open_table("staterevisions_comments").unwrap();
    let snaps = db.open_table("statesnapshots").unwrap();
    let refs_ss = db.open_table("references_s_s").unwrap();

    let s = "/state/aaa-app-primary";

    let txn = db.transaction().unwrap();
    let closure: RevisionClosure = [(s.to_string(), Snapshots::new())].into();
    let (rev1, ts1) =
        set_state_revisions(&txn, revs, comments, snaps, &closure, s, "initial").unwrap();
    set_state_reference_list(&txn, refs_ss, revs, s, &["/state/dep-1".into()], 0, ts1).unwrap();

    let (rev2, ts2) = set_state_revisions(&txn, revs, comments, snaps, &closure, s, "").unwrap();
    set_state_reference_list(&txn, refs_ss, revs, s, &["/state/dep-2".into()], 0, ts2).unwrap();
    txn.commit().unwrap();

    assert_eq!((rev1, rev2), (1, 2));

    let at = |rev| {
        query_state_reference_list(&db, refs_ss, revs, s, rev, 0)
            .unwrap()
            .unwrap()
    };
    assert_eq!(at(1), vec!["/state/dep-1"]);
    assert_eq!(at(2), vec!["/state/dep-2"]);
    assert_eq!(at(0), vec!["/state/dep-2"]);

    // the physical key for revision 1 is the composite (path, ts1)
    assert_eq!(
        db.get_list(refs_ss, &merge_db_key(s, ts1)).unwrap(),
        vec!["/state/dep-1"]
    );
}
