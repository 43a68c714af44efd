//! End-to-end tests for the local store: ingestion, text artifacts,
//! stateful derivers, revisions, sharing, export/import, verification
//! and schema upgrades, each against a store under a scratch root.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use stratum_store_core::derivation::{Derivation, DerivationOutput, StateOutput};
use stratum_store_core::hash::HashAlgo;
use stratum_store_core::signing::SigningKey;
use stratum_store_db::{Db, RevisionClosure, Snapshots};
use stratum_store::{
    hash_path, LocalStore, StoreConfig, StoreError, Substitute, ValidPathInfo, VerifyIssue,
};

fn open_store(root: &Path) -> LocalStore {
    LocalStore::open(StoreConfig::under_root(root), false).unwrap()
}

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(root).unwrap();
    for (name, contents) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
}

/// A registered-but-synthetic state path under the store's state root.
fn make_state_path(store: &LocalStore, hash_char: char, name: &str) -> String {
    format!(
        "{}/{}-{}",
        store.store_dirs().state_dir,
        hash_char.to_string().repeat(32),
        name
    )
}

fn register_state_path(store: &mut LocalStore, path: &str) {
    store
        .register_valid_path(&ValidPathInfo {
            path: path.to_string(),
            ..Default::default()
        })
        .unwrap();
}

/// Ingesting a tree is deterministic, validates the path, and repeat
/// ingestion is a no-op returning the same path.
#[test]
fn ingest_is_deterministic_and_idempotent() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let src = root.path().join("src");
    write_tree(&src, &[("hello", "hi\n")]);

    let first = store
        .add_to_store(&src, false, true, HashAlgo::Sha256)
        .unwrap();
    let second = store
        .add_to_store(&src, false, true, HashAlgo::Sha256)
        .unwrap();
    assert_eq!(first, second);

    assert!(store.is_valid(&first).unwrap());
    assert_eq!(
        store.query_hash(&first).unwrap(),
        hash_path(HashAlgo::Sha256, Path::new(&first)).unwrap()
    );
    assert!(store.query_references(&first, 0).unwrap().is_empty());
    assert_eq!(
        fs::read_to_string(Path::new(&first).join("hello")).unwrap(),
        "hi\n"
    );

    // identical content under a different source name gets another path
    let other = root.path().join("other");
    write_tree(&other, &[("hello", "hi\n")]);
    let third = store
        .add_to_store(&other, false, true, HashAlgo::Sha256)
        .unwrap();
    assert_ne!(first, third);
}

/// A text artifact and an ingested file with the same bytes get distinct
/// paths (the type string differs), and text references are part of the
/// identity.
#[test]
fn text_artifacts_are_their_own_type() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let src = root.path().join("greet");
    fs::write(&src, "hi\n").unwrap();
    let ingested = store
        .add_to_store(&src, false, true, HashAlgo::Sha256)
        .unwrap();

    let text = store
        .add_text_to_store("greet", "hi\n", &BTreeSet::new())
        .unwrap();
    assert_ne!(ingested, text);
    assert!(store.is_valid(&text).unwrap());
    assert!(store.query_references(&text, 0).unwrap().is_empty());

    let dep = store
        .add_text_to_store("dep", "dep contents", &BTreeSet::new())
        .unwrap();
    let with_refs = store
        .add_text_to_store("greet", "hi\n", &[dep.clone()].into())
        .unwrap();
    assert_ne!(text, with_refs);
    assert_eq!(
        store.query_references(&with_refs, 0).unwrap(),
        [dep].into()
    );
}

fn stateful_drv_json(component: &str, identifier: &str, user: &str, seed: &str) -> String {
    let mut outputs = BTreeMap::new();
    outputs.insert(
        "out".to_string(),
        DerivationOutput {
            path: component.to_string(),
        },
    );
    let mut state_outputs = BTreeMap::new();
    state_outputs.insert(
        "state".to_string(),
        StateOutput {
            state_path: format!("/placeholder-{seed}"),
            state_identifier: identifier.to_string(),
            username: user.to_string(),
            component_hash: seed.to_string(),
        },
    );
    Derivation {
        outputs,
        state_outputs,
        input_sources: BTreeSet::new(),
        env: BTreeMap::new(),
    }
    .to_json()
}

/// Registering a second stateful deriver for the same (identifier, user)
/// pair evicts the first and deletes its derivation file from disk.
#[test]
fn stateful_deriver_eviction() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let src = root.path().join("app");
    write_tree(&src, &[("bin", "app binary")]);
    let component = store
        .add_to_store(&src, false, true, HashAlgo::Sha256)
        .unwrap();

    let d1 = store
        .add_text_to_store(
            "app-1.drv",
            &stateful_drv_json(&component, "s", "u", "one"),
            &BTreeSet::new(),
        )
        .unwrap();
    store
        .register_valid_path(&ValidPathInfo {
            path: component.clone(),
            hash: Some(store.query_hash(&component).unwrap()),
            deriver: d1.clone(),
            ..Default::default()
        })
        .unwrap();
    assert!(store.is_state_component(&component).unwrap());
    assert_eq!(
        store.query_derivers(&component, "s", "u").unwrap(),
        vec![d1.clone()]
    );

    let d2 = store
        .add_text_to_store(
            "app-2.drv",
            &stateful_drv_json(&component, "s", "u", "two"),
            &BTreeSet::new(),
        )
        .unwrap();
    store
        .register_valid_path(&ValidPathInfo {
            path: component.clone(),
            hash: Some(store.query_hash(&component).unwrap()),
            deriver: d2.clone(),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(
        store.query_derivers(&component, "s", "u").unwrap(),
        vec![d2.clone()]
    );
    assert!(!Path::new(&d1).exists(), "evicted derivation file remains");
    assert!(Path::new(&d2).exists());

    // a different identifier coexists
    let d3 = store
        .add_text_to_store(
            "app-3.drv",
            &stateful_drv_json(&component, "other", "u", "three"),
            &BTreeSet::new(),
        )
        .unwrap();
    store
        .register_valid_path(&ValidPathInfo {
            path: component.clone(),
            hash: Some(store.query_hash(&component).unwrap()),
            deriver: d3.clone(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        store.query_derivers(&component, "*", "u").unwrap().len(),
        2
    );
    assert!(Path::new(&d2).exists());
}

/// State references are pinned to revisions: revision r answers with the
/// references as they were then.
#[test]
fn state_references_follow_revisions() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let s = make_state_path(&store, 'a', "app-primary");
    let dep1 = make_state_path(&store, 'b', "db-primary");
    let dep2 = make_state_path(&store, 'c', "cache-primary");
    for p in [&s, &dep1, &dep2] {
        register_state_path(&mut store, p);
    }

    // revision 1: S depends on dep1
    store
        .register_valid_path(&ValidPathInfo {
            path: s.clone(),
            state_references: [dep1.clone()].into(),
            ..Default::default()
        })
        .unwrap();
    let closure: RevisionClosure = [(s.clone(), Snapshots::new())].into();
    let (rev1, _) = store.set_state_revisions(&closure, &s, "first").unwrap();

    // revision 2: S depends on dep2
    store
        .register_valid_path(&ValidPathInfo {
            path: s.clone(),
            state_references: [dep2.clone()].into(),
            ..Default::default()
        })
        .unwrap();
    let (rev2, _) = store.set_state_revisions(&closure, &s, "second").unwrap();

    assert_eq!((rev1, rev2), (1, 2));
    assert_eq!(
        store.query_state_references(&s, 1).unwrap(),
        [dep1.clone()].into()
    );
    assert_eq!(
        store.query_state_references(&s, 2).unwrap(),
        [dep2.clone()].into()
    );
    assert_eq!(
        store.query_state_references(&s, 0).unwrap(),
        [dep2.clone()].into()
    );
    assert!(matches!(
        store.query_state_references(&s, 9),
        Err(StoreError::UnknownRevision { .. })
    ));

    let revisions = store.query_available_state_revisions(&s).unwrap();
    assert_eq!(revisions.len(), 2);
    assert_eq!(revisions[0].comment, "first");

    // state referrers of dep1 exist at revision 1 of dep1's world but
    // not in the latest one
    assert_eq!(
        store.query_state_referrers(&dep1, 0).unwrap(),
        BTreeSet::new()
    );
    let at_rev1 = store.query_state_referrers(&s, 1).unwrap();
    assert!(at_rev1.is_empty() || at_rev1.contains(&s));
}

/// Alias chains resolve to their tail; reverse lookup is transitive;
/// cycles are rejected.
#[test]
fn sharing_chains() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let a = make_state_path(&store, 'a', "app-alias");
    let b = make_state_path(&store, 'b', "app-mid");
    let c = make_state_path(&store, 'c', "app-tail");
    for p in [&a, &b, &c] {
        register_state_path(&mut store, p);
    }

    // a → b → c
    store.set_shared_state(&c, &b).unwrap();
    store.set_shared_state(&b, &a).unwrap();

    assert_eq!(store.to_non_shared_path(&a).unwrap(), c);
    assert_eq!(
        store.to_non_shared_path(&store.to_non_shared_path(&a).unwrap()).unwrap(),
        c,
        "resolution is idempotent"
    );
    let shared = store.shared_with_rec(&c).unwrap();
    assert!(shared.contains(&a) && shared.contains(&b));
    assert!(!shared.contains(&c));

    // rebinding replaces the old binding
    store.set_shared_state(&c, &a).unwrap();
    assert_eq!(store.to_non_shared_path(&a).unwrap(), c);

    // closing a cycle is rejected
    assert!(matches!(
        store.set_shared_state(&a, &c),
        Err(StoreError::SharingChainTooLong(_))
    ));
    assert_eq!(store.to_non_shared_path(&a).unwrap(), c);
}

fn write_signing_keys(store_root: &Path) {
    let key = SigningKey::parse("stratum-test-1:zFD7RJEU40VJzJvgT7h5xQwFm8FufXKH2CJPaKvh/xo=")
        .unwrap();
    let sec = store_root.join("etc/signing-key.sec");
    let public = store_root.join("etc/signing-key.pub");
    fs::create_dir_all(sec.parent().unwrap()).unwrap();
    fs::write(&sec, "stratum-test-1:zFD7RJEU40VJzJvgT7h5xQwFm8FufXKH2CJPaKvh/xo=").unwrap();
    fs::set_permissions(&sec, fs::Permissions::from_mode(0o600)).unwrap();
    fs::write(&public, key.public_key_string()).unwrap();
}

/// Unsigned export/import round-trips bit-identically and restores
/// validity after deletion.
#[test]
fn export_import_roundtrip() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let path = store
        .add_text_to_store("hello-data", "export payload\n", &BTreeSet::new())
        .unwrap();

    let mut archive = Vec::new();
    store.export_path(&path, false, &mut archive).unwrap();

    store.delete_from_store(&path).unwrap();
    assert!(!store.is_valid(&path).unwrap());
    assert!(!Path::new(&path).exists());

    let imported = store.import_path(false, &mut archive.as_slice()).unwrap();
    assert_eq!(imported, path);
    assert!(store.is_valid(&path).unwrap());
    assert_eq!(fs::read_to_string(&path).unwrap(), "export payload\n");

    let mut again = Vec::new();
    store.export_path(&path, false, &mut again).unwrap();
    assert_eq!(archive, again, "export of an imported archive is identical");
}

/// Signed export verifies on import; a corrupted tree byte fails with
/// BadSignature; an unsigned archive fails a signature-requiring import.
#[test]
fn signed_import_verification() {
    let root = tempfile::TempDir::new().unwrap();
    write_signing_keys(root.path());
    let mut store = open_store(root.path());

    let path = store
        .add_text_to_store("secret-data", "sealed payload\n", &BTreeSet::new())
        .unwrap();

    let mut signed = Vec::new();
    store.export_path(&path, true, &mut signed).unwrap();

    store.delete_from_store(&path).unwrap();
    let imported = store.import_path(true, &mut signed.as_slice()).unwrap();
    assert_eq!(imported, path);
    assert!(store.is_valid(&path).unwrap());

    // corrupt one byte of the tree portion
    store.delete_from_store(&path).unwrap();
    let needle = b"sealed payload\n";
    let pos = signed
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    let mut corrupted = signed.clone();
    corrupted[pos] ^= 0x01;
    assert!(matches!(
        store.import_path(true, &mut corrupted.as_slice()),
        Err(StoreError::BadSignature(_))
    ));

    // unsigned archive, signature required
    let restored = store.import_path(true, &mut signed.as_slice()).unwrap();
    let mut unsigned = Vec::new();
    store.export_path(&restored, false, &mut unsigned).unwrap();
    store.delete_from_store(&restored).unwrap();
    assert!(matches!(
        store.import_path(true, &mut unsigned.as_slice()),
        Err(StoreError::MissingSignature)
    ));
}

/// Deletion refuses while referrers exist; substitutes survive
/// invalidation; a path with neither leaves no trace.
#[test]
fn deletion_and_invalidation() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let dep = store
        .add_text_to_store("dep", "dep\n", &BTreeSet::new())
        .unwrap();
    let app = store
        .add_text_to_store("app", "app\n", &[dep.clone()].into())
        .unwrap();

    assert!(matches!(
        store.delete_from_store(&dep),
        Err(StoreError::InUse { .. })
    ));

    store.delete_from_store(&app).unwrap();
    assert!(store.query_referrers(&dep, 0).unwrap().is_empty());

    // with a substitute, invalidation keeps the substitute entry
    let sub = Substitute {
        deriver: String::new(),
        program: "/bin/fetch".to_string(),
        args: vec!["--url".to_string(), "https://cache.example/dep".to_string()],
    };
    store.register_substitute(&dep, &sub).unwrap();
    store.delete_from_store(&dep).unwrap();
    assert!(!store.is_valid(&dep).unwrap());
    assert_eq!(store.query_substitutes(&dep).unwrap(), vec![sub]);

    // re-registering the same substitute promotes, not duplicates
    let other = Substitute {
        deriver: String::new(),
        program: "/bin/other".to_string(),
        args: vec![],
    };
    store.register_substitute(&dep, &other).unwrap();
    let subs = store.query_substitutes(&dep).unwrap();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].program, "/bin/other");

    store.clear_substitutes().unwrap();
    assert!(store.query_substitutes(&dep).unwrap().is_empty());
}

/// A self-referencing registration is legal, and referrers are exactly
/// the inverse of references.
#[test]
fn referrers_invert_references() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let dep = store
        .add_text_to_store("base", "base\n", &BTreeSet::new())
        .unwrap();
    let mid = store
        .add_text_to_store("mid", "mid\n", &[dep.clone()].into())
        .unwrap();
    let top = store
        .add_text_to_store("top", "top\n", &[dep.clone(), mid.clone()].into())
        .unwrap();

    // self-loop: register top again referencing itself as well
    store
        .register_valid_path(&ValidPathInfo {
            path: top.clone(),
            hash: Some(store.query_hash(&top).unwrap()),
            references: [dep.clone(), mid.clone(), top.clone()].into(),
            ..Default::default()
        })
        .unwrap();

    let all = [dep.clone(), mid.clone(), top.clone()];
    for target in &all {
        let referrers = store.query_referrers(target, 0).unwrap();
        let expected: BTreeSet<String> = all
            .iter()
            .filter(|x| {
                store
                    .query_references(x, 0)
                    .unwrap()
                    .contains(target.as_str())
            })
            .cloned()
            .collect();
        assert_eq!(referrers, expected, "inverse mismatch for {target}");
    }
    assert!(store.query_referrers(&top, 0).unwrap().contains(&top));
}

/// Closures follow the selected edge colours and requisites expand
/// derivation outputs.
#[test]
fn closure_and_requisites() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let c = store
        .add_text_to_store("libc", "libc\n", &BTreeSet::new())
        .unwrap();
    let b = store
        .add_text_to_store("lib", "lib\n", &[c.clone()].into())
        .unwrap();
    let a = store
        .add_text_to_store("bin", "bin\n", &[b.clone()].into())
        .unwrap();

    let s = make_state_path(&store, 'e', "bin-primary");
    register_state_path(&mut store, &s);
    store
        .register_valid_path(&ValidPathInfo {
            path: a.clone(),
            hash: Some(store.query_hash(&a).unwrap()),
            references: [b.clone()].into(),
            state_references: [s.clone()].into(),
            ..Default::default()
        })
        .unwrap();

    let start: BTreeSet<String> = [a.clone()].into();
    let components_only = store.compute_closure(&start, true, false, 0).unwrap();
    assert_eq!(components_only, [a.clone(), b.clone(), c.clone()].into());

    let with_state = store.compute_closure(&start, true, true, 0).unwrap();
    assert!(with_state.contains(&s));

    // requisites of a derivation include the closures of its valid outputs
    let drv_json = Derivation {
        outputs: [(
            "out".to_string(),
            DerivationOutput { path: a.clone() },
        )]
        .into(),
        state_outputs: BTreeMap::new(),
        input_sources: BTreeSet::new(),
        env: BTreeMap::new(),
    }
    .to_json();
    let drv = store
        .add_text_to_store("bin.drv", &drv_json, &BTreeSet::new())
        .unwrap();

    let without = store.requisites(&drv, false, true, false, 0).unwrap();
    assert!(!without.contains(&a));
    let with = store.requisites(&drv, true, true, false, 0).unwrap();
    assert!(with.contains(&a) && with.contains(&b) && with.contains(&c));
}

/// Verification invalidates disappeared paths and reports incomplete
/// closures without repairing them.
#[test]
fn verify_detects_disappearance_and_dangling_references() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let dep = store
        .add_text_to_store("gone", "gone\n", &BTreeSet::new())
        .unwrap();
    let app = store
        .add_text_to_store("app", "app\n", &[dep.clone()].into())
        .unwrap();

    fs::remove_file(&dep).unwrap();
    let issues = store.verify(false).unwrap();

    assert!(issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::PathDisappeared(p) if *p == dep)));
    assert!(issues.iter().any(
        |i| matches!(i, VerifyIssue::IncompleteClosure { path, missing } if *path == app && *missing == dep)
    ));
    assert!(!store.is_valid(&dep).unwrap());
    assert!(store.is_valid(&app).unwrap());

    // deep check flags modified contents
    fs::set_permissions(&app, fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(&app, "tampered\n").unwrap();
    let issues = store.verify(true).unwrap();
    assert!(issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::HashMismatch { path, .. } if *path == app)));
}

/// Committing snapshots a state path's subpaths; reverting restores the
/// old contents and appends a new revision instead of rewriting history.
#[test]
fn commit_and_revert_state_path() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let s = make_state_path(&store, 'f', "svc-primary");
    write_tree(Path::new(&s), &[("log", "day one\n"), ("cache", "warm\n")]);
    register_state_path(&mut store, &s);

    let snaps1 = store.commit_state_path(&s).unwrap();
    assert_eq!(
        snaps1.keys().cloned().collect::<Vec<_>>(),
        vec!["cache", "log"]
    );
    let closure1: RevisionClosure = [(s.clone(), snaps1)].into();
    store.set_state_revisions(&closure1, &s, "day one").unwrap();

    fs::write(Path::new(&s).join("log"), "day two\n").unwrap();
    fs::write(Path::new(&s).join("scratch"), "untracked\n").unwrap();
    let snaps2 = store.commit_state_path(&s).unwrap();
    let closure2: RevisionClosure = [(s.clone(), snaps2)].into();
    store.set_state_revisions(&closure2, &s, "day two").unwrap();

    store.revert_to_revision(&s, 1, false).unwrap();
    assert_eq!(
        fs::read_to_string(Path::new(&s).join("log")).unwrap(),
        "day one\n"
    );
    assert_eq!(
        fs::read_to_string(Path::new(&s).join("cache")).unwrap(),
        "warm\n"
    );
    assert!(
        !Path::new(&s).join("scratch").exists(),
        "subpaths unknown to the snapshot are removed"
    );

    let revisions = store.query_available_state_revisions(&s).unwrap();
    assert_eq!(revisions.len(), 3, "the revert is itself a revision");
    assert_eq!(revisions[2].comment, "revert to revision 1");
}

/// Interval counters skip snapshots of not-yet-due subpaths, carrying
/// the previous snapshot timestamp forward.
#[test]
fn interval_counters_gate_snapshots() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let s = make_state_path(&store, 'g', "svc-primary");
    write_tree(Path::new(&s), &[("log", "l1\n"), ("cache", "c1\n")]);
    register_state_path(&mut store, &s);

    store
        .set_state_paths_interval(&[(format!("{s}/log"), 2)])
        .unwrap();
    assert_eq!(
        store
            .get_state_paths_interval(&[format!("{s}/log")])
            .unwrap(),
        vec![2]
    );

    let snaps1 = store.commit_state_path(&s).unwrap();
    store
        .set_state_revisions(&[(s.clone(), snaps1.clone())].into(), &s, "")
        .unwrap();

    let snaps2 = store.commit_state_path(&s).unwrap();
    assert_eq!(
        snaps2["log"], snaps1["log"],
        "log is on a 2-commit interval and keeps its old snapshot"
    );
    assert!(snaps2["cache"] > snaps1["cache"]);

    let snaps3 = store.commit_state_path(&s).unwrap();
    assert!(snaps3["log"] > snaps1["log"], "third commit is due again");
}

/// Scanning discovers component and state references from the tree, plus
/// configured solid references.
#[test]
fn scan_discovers_references() {
    let root = tempfile::TempDir::new().unwrap();
    let mut store = open_store(root.path());

    let dep = store
        .add_text_to_store("tool", "tool\n", &BTreeSet::new())
        .unwrap();
    let solid = store
        .add_text_to_store("plugin", "plugin\n", &BTreeSet::new())
        .unwrap();
    let other_state = make_state_path(&store, 'h', "db-primary");
    register_state_path(&mut store, &other_state);

    let s = make_state_path(&store, 'i', "svc-primary");
    write_tree(
        Path::new(&s),
        &[("conf", &format!("tool={dep}\npeer={other_state}\n"))],
    );
    register_state_path(&mut store, &s);
    store
        .set_solid_state_references(&s, &[solid.clone()].into())
        .unwrap();

    store.scan_and_update_all_references(&s, false).unwrap();

    let refs = store.query_references(&s, 0).unwrap();
    assert!(refs.contains(&dep));
    assert!(refs.contains(&solid), "solid references always included");
    assert_eq!(
        store.query_state_references(&s, 0).unwrap(),
        [other_state].into()
    );
}

/// Schema upgrades: version 1 databases get their paths hashed and
/// legacy closure documents folded into the reference tables; version 4
/// is tolerated; newer versions are refused; garbage is corrupt.
#[test]
fn schema_upgrades() {
    let root = tempfile::TempDir::new().unwrap();

    // seed a legacy version-1 store by hand
    let config = StoreConfig::under_root(root.path());
    {
        let store = open_store(root.path());
        drop(store);
    }
    assert_eq!(
        fs::read_to_string(config.schema_path()).unwrap(),
        "3",
        "fresh stores start at the current schema"
    );

    let unhashed = format!("{}/{}-legacy", config.store_dir, "j".repeat(32));
    fs::write(&unhashed, "legacy contents\n").unwrap();
    let member = format!("{}/{}-member", config.store_dir, "k".repeat(32));
    fs::write(&member, "member\n").unwrap();
    let closure = format!("{}/{}-roots.closure", config.store_dir, "l".repeat(32));
    fs::write(
        &closure,
        format!("{{\"{unhashed}\": [\"{member}\"]}}"),
    )
    .unwrap();

    {
        let mut db = Db::open(&config.db_path()).unwrap();
        let valid = db.open_table("validpaths").unwrap();
        let txn = db.transaction().unwrap();
        txn.put_string(valid, &unhashed, "").unwrap();
        txn.put_string(valid, &member, "sha256:").unwrap();
        txn.put_string(valid, &closure, "sha256:").unwrap();
        txn.commit().unwrap();
    }
    fs::write(config.schema_path(), "1").unwrap();

    {
        let store = open_store(root.path());
        assert_eq!(fs::read_to_string(config.schema_path()).unwrap(), "3");
        assert_eq!(
            store.query_hash(&unhashed).unwrap(),
            hash_path(HashAlgo::Sha256, Path::new(&unhashed)).unwrap()
        );
        assert_eq!(
            store.query_references(&unhashed, 0).unwrap(),
            [member.clone()].into()
        );
    }

    // a legacy reverse index is dropped by the 2 → 3 step
    {
        let mut db = Db::open(&config.db_path()).unwrap();
        db.open_table("referrers").unwrap();
    }
    fs::write(config.schema_path(), "2").unwrap();
    {
        let _store = open_store(root.path());
        let db = Db::open(&config.db_path()).unwrap();
        assert!(!db.table_exists("referrers").unwrap());
    }

    fs::write(config.schema_path(), "4").unwrap();
    let _tolerated = open_store(root.path());
    assert_eq!(fs::read_to_string(config.schema_path()).unwrap(), "4");

    fs::write(config.schema_path(), "9").unwrap();
    assert!(matches!(
        LocalStore::open(StoreConfig::under_root(root.path()), false),
        Err(StoreError::SchemaTooNew { found: 9, .. })
    ));

    fs::write(config.schema_path(), "not-a-number").unwrap();
    assert!(matches!(
        LocalStore::open(StoreConfig::under_root(root.path()), false),
        Err(StoreError::SchemaCorrupt(_))
    ));
}

/// The reserved space file appears when requested and disappears when
/// not.
#[test]
fn reserved_space_file() {
    let root = tempfile::TempDir::new().unwrap();
    let config = StoreConfig::under_root(root.path());

    {
        let _store = LocalStore::open(config.clone(), true).unwrap();
        let metadata = fs::metadata(config.reserved_path()).unwrap();
        assert_eq!(metadata.len(), config.gc_reserved_space);
    }
    {
        let _store = LocalStore::open(config.clone(), false).unwrap();
        assert!(!config.reserved_path().exists());
    }
}

/// An unwritable database directory degrades the store to read-only.
#[test]
fn read_only_degradation() {
    let root = tempfile::TempDir::new().unwrap();
    let config = StoreConfig::under_root(root.path());

    // populate, then lock the database directory down
    {
        let mut store = LocalStore::open(config.clone(), false).unwrap();
        store
            .add_text_to_store("kept", "kept\n", &BTreeSet::new())
            .unwrap();
    }
    fs::set_permissions(&config.db_dir, fs::Permissions::from_mode(0o555)).unwrap();

    // privileged processes ignore directory modes; nothing to observe then
    if fs::File::create(Path::new(&config.db_dir).join(".probe")).is_ok() {
        let _ = fs::remove_file(Path::new(&config.db_dir).join(".probe"));
        fs::set_permissions(&config.db_dir, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let mut store = LocalStore::open(config.clone(), false).unwrap();
    assert!(store.is_read_only());
    assert!(matches!(
        store.add_text_to_store("nope", "nope\n", &BTreeSet::new()),
        Err(StoreError::ReadOnly)
    ));

    fs::set_permissions(&config.db_dir, fs::Permissions::from_mode(0o755)).unwrap();
}
