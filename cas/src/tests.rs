// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{Store, StoreError, TreeDiff};

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use hashing::Digest;
use tempfile::TempDir;
use testutil::data::TestData;

fn new_store(dir: &Path) -> Store {
    Store::new(dir).unwrap()
}

fn write_file(path: &Path, content: &str, mode: u32) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

fn set_mtime(path: &Path, time: SystemTime) {
    fs_set_times::set_mtime(path, fs_set_times::SystemTimeSpec::Absolute(time)).unwrap();
}

#[test]
fn preflight_checks_repository_layout() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());
    store.preflight().unwrap();

    std::fs::remove_dir_all(dir.path().join("cas").join("objects")).unwrap();
    store.preflight().expect_err("Want preflight failure");
}

#[test]
fn set_and_resolve_ref() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let digest = TestData::hello().digest();
    store.set_ref("artifacts/base/deadbeef", digest).unwrap();

    assert!(store.contains("artifacts/base/deadbeef"));
    assert_eq!(
        store.resolve_ref("artifacts/base/deadbeef", false).unwrap(),
        digest
    );

    match store.resolve_ref("missing", false) {
        Err(StoreError::RefNotFound(name)) => assert_eq!(name, "missing"),
        other => panic!("Want RefNotFound, got: {other:?}"),
    }
}

#[test]
fn set_ref_replaces_existing() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    store.set_ref("r", TestData::hello().digest()).unwrap();
    let updated = TestData::new("other").digest();
    store.set_ref("r", updated).unwrap();
    assert_eq!(store.resolve_ref("r", false).unwrap(), updated);
}

#[test]
fn link_ref_aliases_the_same_tree() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let digest = TestData::hello().digest();
    store.set_ref("old", digest).unwrap();
    store.link_ref("old", "new").unwrap();
    assert_eq!(store.resolve_ref("new", false).unwrap(), digest);
}

#[test]
fn resolve_ref_optionally_touches() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    store.set_ref("r", TestData::hello().digest()).unwrap();
    let refpath = store.ref_path("r");
    let past = SystemTime::now() - Duration::from_secs(100_000);
    set_mtime(&refpath, past);

    store.resolve_ref("r", false).unwrap();
    assert_eq!(
        std::fs::metadata(&refpath).unwrap().modified().unwrap(),
        past
    );

    store.resolve_ref("r", true).unwrap();
    assert!(std::fs::metadata(&refpath).unwrap().modified().unwrap() > past);
}

#[test]
fn update_mtime_of_missing_ref() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());
    match store.update_mtime("missing") {
        Err(StoreError::RefNotFound(name)) => assert_eq!(name, "missing"),
        other => panic!("Want RefNotFound, got: {other:?}"),
    }
}

#[tokio::test]
async fn list_refs_in_least_recently_modified_order() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let digest = TestData::hello().digest();
    for name in ["a", "nested/b", "c"] {
        store.set_ref(name, digest).unwrap();
    }
    let base = SystemTime::now() - Duration::from_secs(10_000);
    set_mtime(&store.ref_path("c"), base);
    set_mtime(&store.ref_path("a"), base + Duration::from_secs(100));
    set_mtime(&store.ref_path("nested/b"), base + Duration::from_secs(200));

    assert_eq!(
        store.list_refs().await.unwrap(),
        vec!["c".to_owned(), "a".to_owned(), "nested/b".to_owned()]
    );
}

#[tokio::test]
async fn clean_up_refs_until_removes_strictly_older() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let digest = TestData::hello().digest();
    store.set_ref("old", digest).unwrap();
    store.set_ref("cutoff", digest).unwrap();
    store.set_ref("fresh", digest).unwrap();

    let base = SystemTime::now() - Duration::from_secs(10_000);
    set_mtime(&store.ref_path("old"), base - Duration::from_secs(100));
    set_mtime(&store.ref_path("cutoff"), base);
    set_mtime(&store.ref_path("fresh"), base + Duration::from_secs(100));

    store.clean_up_refs_until(base).await.unwrap();
    assert!(!store.contains("old"));
    assert!(store.contains("cutoff"));
    assert!(store.contains("fresh"));
}

#[tokio::test]
async fn list_objects_in_least_recently_modified_order() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let early = store.add_object(b"early").await.unwrap();
    let late = store.add_object(b"late").await.unwrap();
    let base = SystemTime::now() - Duration::from_secs(10_000);
    set_mtime(&store.object_path(early), base);
    set_mtime(&store.object_path(late), base + Duration::from_secs(100));

    let listed = store.list_objects().await.unwrap();
    assert_eq!(
        listed
            .into_iter()
            .map(|(_, path)| path)
            .collect::<Vec<_>>(),
        vec![store.object_path(early), store.object_path(late)]
    );
}

#[tokio::test]
async fn diff_reports_modified_removed_added() {
    let dir = TempDir::new().unwrap();
    let src_a = TempDir::new().unwrap();
    let src_b = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src_a.path().join("a.txt"), "1", 0o644);
    write_file(&src_a.path().join("b.txt"), "2", 0o644);

    write_file(&src_b.path().join("a.txt"), "1", 0o644);
    write_file(&src_b.path().join("b.txt"), "modified", 0o644);
    write_file(&src_b.path().join("c.txt"), "3", 0o644);

    store.commit(&["a"], src_a.path()).await.unwrap();
    store.commit(&["b"], src_b.path()).await.unwrap();

    let diff = store.diff("a", "b", None).await.unwrap();
    assert_eq!(
        diff,
        TreeDiff {
            modified: vec!["b.txt".to_owned()],
            removed: vec![],
            added: vec!["c.txt".to_owned()],
        }
    );
}

#[tokio::test]
async fn diff_recurses_into_subdirectories() {
    let dir = TempDir::new().unwrap();
    let src_a = TempDir::new().unwrap();
    let src_b = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src_a.path().join("same").join("s.txt"), "s", 0o644);
    write_file(&src_a.path().join("sub").join("f.txt"), "old", 0o644);
    write_file(&src_a.path().join("gone").join("g.txt"), "g", 0o644);

    write_file(&src_b.path().join("same").join("s.txt"), "s", 0o644);
    write_file(&src_b.path().join("sub").join("f.txt"), "new", 0o644);
    write_file(&src_b.path().join("fresh").join("n.txt"), "n", 0o644);

    store.commit(&["a"], src_a.path()).await.unwrap();
    store.commit(&["b"], src_b.path()).await.unwrap();

    let diff = store.diff("a", "b", None).await.unwrap();
    assert_eq!(
        diff,
        TreeDiff {
            modified: vec!["sub/f.txt".to_owned()],
            removed: vec!["gone/g.txt".to_owned()],
            added: vec!["fresh/n.txt".to_owned()],
        }
    );

    let narrowed = store.diff("a", "b", Some("sub")).await.unwrap();
    assert_eq!(
        narrowed,
        TreeDiff {
            modified: vec!["f.txt".to_owned()],
            removed: vec![],
            added: vec![],
        }
    );
}

#[tokio::test]
async fn diff_is_symmetric() {
    let dir = TempDir::new().unwrap();
    let src_a = TempDir::new().unwrap();
    let src_b = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src_a.path().join("m.txt"), "1", 0o644);
    write_file(&src_a.path().join("r.txt"), "r", 0o644);
    write_file(&src_b.path().join("m.txt"), "2", 0o644);
    write_file(&src_b.path().join("a.txt"), "a", 0o644);

    store.commit(&["a"], src_a.path()).await.unwrap();
    store.commit(&["b"], src_b.path()).await.unwrap();

    let forward = store.diff("a", "b", None).await.unwrap();
    let backward = store.diff("b", "a", None).await.unwrap();
    assert_eq!(forward.modified, backward.modified);
    assert_eq!(forward.added, backward.removed);
    assert_eq!(forward.removed, backward.added);
}

#[tokio::test]
async fn prune_sweeps_only_unreachable_objects() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("only1.txt"), "only in r1\n", 0o644);
    write_file(&src.path().join("shared").join("x.txt"), "shared\n", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    // r2 names the `shared` subtree of r1.
    let shared = store.subdir_digest(root, "shared").await.unwrap();
    store.set_ref("r2", shared).unwrap();

    let only1 = Digest::of_bytes(b"only in r1\n");
    let removed = store.remove("r1", true).await.unwrap();
    assert_eq!(removed, None);

    let pruned = store.prune().await.unwrap();
    // r1's root Directory and its private file are gone.
    assert_eq!(pruned, only1.size_bytes + root.size_bytes);
    assert!(!store.contains_object(only1).await);
    assert!(!store.contains_object(root).await);
    // Everything reachable from r2 is still there and extractable.
    assert_eq!(store.resolve_ref("r2", false).unwrap(), shared);
    let extracted = store.extract("r2", dest.path(), None).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(extracted.join("x.txt")).unwrap(),
        "shared\n"
    );
}

#[tokio::test]
async fn remove_prunes_immediately_unless_deferred() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("a.txt"), "hello\n", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    let pruned = store.remove("r1", false).await.unwrap();
    assert!(pruned.unwrap() > 0);
    assert!(!store.contains_object(root).await);

    match store.remove("r1", false).await {
        Err(StoreError::RefNotFound(name)) => assert_eq!(name, "r1"),
        other => panic!("Want RefNotFound, got: {other:?}"),
    }
}

#[tokio::test]
async fn prune_with_no_refs_empties_the_store() {
    let dir = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let data = TestData::hello();
    store.add_object(&data.bytes()).await.unwrap();
    let pruned = store.prune().await.unwrap();
    assert_eq!(pruned, data.len());
    assert_eq!(store.list_objects().await.unwrap(), vec![]);
}

#[tokio::test]
async fn update_tree_mtime_touches_every_reachable_object() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("a.txt"), "hello\n", 0o644);
    write_file(&src.path().join("sub").join("b.txt"), "b", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    let past = SystemTime::now() - Duration::from_secs(100_000);
    for (_, path) in store.list_objects().await.unwrap() {
        set_mtime(&path, past);
    }

    store.update_tree_mtime(root).await.unwrap();

    for (mtime, path) in store.list_objects().await.unwrap() {
        assert!(
            mtime > past + Duration::from_secs(1_000),
            "{path:?} was not touched"
        );
    }
}

#[tokio::test]
async fn calculate_cache_size_tracks_stored_bytes() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let empty = store.calculate_cache_size().await.unwrap();
    assert_eq!(empty, 0);

    write_file(&src.path().join("a.txt"), "hello\n", 0o644);
    store.commit(&["r1"], src.path()).await.unwrap();

    let used = store.calculate_cache_size().await.unwrap();
    // At least the file blob, the Directory blob and the ref file.
    assert!(used > "hello\n".len(), "Got: {used}");
}

#[tokio::test]
async fn contains_subdir_artifact_tolerates_dangling_trees() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("sub").join("b.txt"), "b", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    assert!(store.contains_subdir_artifact("r1", "sub").await.unwrap());
    assert!(!store.contains_subdir_artifact("r1", "nope").await.unwrap());

    // Dropping the subtree blob leaves a dangling reference, not an error.
    let sub = store.subdir_digest(root, "sub").await.unwrap();
    std::fs::remove_file(store.object_path(sub)).unwrap();
    assert!(!store.contains_subdir_artifact("r1", "sub").await.unwrap());

    // And a fully dangling root is tolerated too.
    std::fs::remove_file(store.object_path(root)).unwrap();
    assert!(!store.contains_subdir_artifact("r1", "sub").await.unwrap());
}


