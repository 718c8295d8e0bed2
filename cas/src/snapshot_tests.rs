// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::snapshot::move_atomic;
use crate::{Store, StoreError};

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use hashing::EMPTY_DIGEST;
use tempfile::TempDir;
use walkdir::WalkDir;

fn new_store(dir: &Path) -> Store {
    Store::new(dir).unwrap()
}

fn write_file(path: &Path, content: &str, mode: u32) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

fn object_count(store_root: &Path) -> usize {
    WalkDir::new(store_root.join("cas").join("objects"))
        .into_iter()
        .filter(|entry| entry.as_ref().unwrap().file_type().is_file())
        .count()
}

/// The standard input tree: a plain file, an executable in a subdirectory, and a symlink.
fn populate_source(src: &Path) {
    write_file(&src.join("a.txt"), "hello\n", 0o644);
    write_file(&src.join("bin").join("run"), "#!/bin/sh\n", 0o755);
    std::os::unix::fs::symlink("a.txt", src.join("link")).unwrap();
}

#[tokio::test]
async fn commit_and_extract_roundtrip() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    populate_source(src.path());
    let tree = store.commit(&["r1"], src.path()).await.unwrap();

    // Four blobs: a.txt, bin/run, the bin Directory and the root Directory.
    assert_eq!(object_count(dir.path()), 4);
    assert!(store.contains("r1"));
    assert_eq!(store.resolve_ref("r1", false).unwrap(), tree);

    let extracted = store.extract("r1", dest.path(), None).await.unwrap();
    assert_eq!(extracted, dest.path().join(tree.hash.to_hex()));

    assert_eq!(
        std::fs::read_to_string(extracted.join("a.txt")).unwrap(),
        "hello\n"
    );
    let run = extracted.join("bin").join("run");
    assert_eq!(std::fs::read_to_string(&run).unwrap(), "#!/bin/sh\n");
    assert_ne!(
        std::fs::metadata(&run).unwrap().permissions().mode() & 0o100,
        0,
        "bin/run must be executable"
    );
    let link = extracted.join("link");
    assert!(std::fs::symlink_metadata(&link)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        std::path::PathBuf::from("a.txt")
    );
}

#[tokio::test]
async fn commit_is_invariant_under_creation_order() {
    let dir = TempDir::new().unwrap();
    let src_a = TempDir::new().unwrap();
    let src_b = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src_a.path().join("x.txt"), "x", 0o644);
    write_file(&src_a.path().join("y.txt"), "y", 0o644);

    write_file(&src_b.path().join("y.txt"), "y", 0o644);
    write_file(&src_b.path().join("x.txt"), "x", 0o644);

    let tree_a = store.commit(&["a"], src_a.path()).await.unwrap();
    let tree_b = store.commit(&["b"], src_b.path()).await.unwrap();
    assert_eq!(tree_a, tree_b);
}

#[tokio::test]
async fn commit_deduplicates_shared_content() {
    let dir = TempDir::new().unwrap();
    let src_a = TempDir::new().unwrap();
    let src_b = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src_a.path().join("a.txt"), "hello\n", 0o644);
    write_file(&src_a.path().join("b.txt"), "1", 0o644);

    write_file(&src_b.path().join("a.txt"), "hello\n", 0o644);
    write_file(&src_b.path().join("c.txt"), "2", 0o644);

    store.commit(&["a"], src_a.path()).await.unwrap();
    store.commit(&["b"], src_b.path()).await.unwrap();

    // One copy of a.txt, b.txt, c.txt, and the two root Directories.
    assert_eq!(object_count(dir.path()), 5);
}

#[tokio::test]
async fn commit_empty_directory() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let tree = store.commit(&["empty"], src.path()).await.unwrap();
    assert_eq!(tree, EMPTY_DIGEST);

    let extracted = store.extract("empty", dest.path(), None).await.unwrap();
    assert!(std::fs::read_dir(&extracted).unwrap().next().is_none());
}

#[tokio::test]
async fn commit_skips_sockets() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("a.txt"), "hello\n", 0o644);
    let _listener = std::os::unix::net::UnixListener::bind(src.path().join("sock")).unwrap();

    store.commit(&["r1"], src.path()).await.unwrap();
    let extracted = store.extract("r1", dest.path(), None).await.unwrap();
    assert!(extracted.join("a.txt").is_file());
    assert!(!extracted.join("sock").exists());
}

#[tokio::test]
async fn commit_rejects_special_files() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    let fifo = src.path().join("fifo");
    let status = std::process::Command::new("mkfifo")
        .arg(&fifo)
        .status()
        .unwrap();
    assert!(status.success());

    match store.commit(&["r1"], src.path()).await {
        Err(StoreError::UnsupportedFileType(path)) => assert_eq!(path, fifo),
        other => panic!("Want UnsupportedFileType, got: {other:?}"),
    }
}

#[tokio::test]
async fn extract_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    populate_source(src.path());
    store.commit(&["r1"], src.path()).await.unwrap();

    let first = store.extract("r1", dest.path(), None).await.unwrap();
    let second = store.extract("r1", dest.path(), None).await.unwrap();
    assert_eq!(first, second);
    assert!(first.join("a.txt").is_file());
}

#[tokio::test]
async fn extract_with_subdir_of_fresh_destination_includes_everything() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("include").join("x.h"), "x", 0o644);
    write_file(&src.path().join("lib").join("y.so"), "y", 0o644);
    store.commit(&["r1"], src.path()).await.unwrap();

    let extracted = store
        .extract("r1", dest.path(), Some("include"))
        .await
        .unwrap();
    // A full extraction covers the requested subdir already.
    assert!(extracted.join("include").join("x.h").is_file());
    assert!(extracted.join("lib").join("y.so").is_file());

    // And asking again for an already-present subdir is a no-op.
    let again = store
        .extract("r1", dest.path(), Some("include"))
        .await
        .unwrap();
    assert_eq!(extracted, again);
}

#[tokio::test]
async fn extract_missing_ref() {
    let dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    match store.extract("nope", dest.path(), None).await {
        Err(StoreError::RefNotFound(name)) => assert_eq!(name, "nope"),
        other => panic!("Want RefNotFound, got: {other:?}"),
    }
}

#[tokio::test]
async fn checkout_omits_dangling_subdirectories() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("a.txt"), "hello\n", 0o644);
    write_file(&src.path().join("sub").join("b.txt"), "b", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    // Drop the subdirectory's Directory blob, leaving the root's reference dangling as a
    // subset pull would.
    let subdir_digest = store.subdir_digest(root, "sub").await.unwrap();
    std::fs::remove_file(store.object_path(subdir_digest)).unwrap();

    let extracted = store.extract("r1", dest.path(), None).await.unwrap();
    assert!(extracted.join("a.txt").is_file());
    assert!(!extracted.join("sub").exists());
}

#[tokio::test]
async fn subdir_digest_resolves_nested_paths() {
    let dir = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let store = new_store(dir.path());

    write_file(&src.path().join("a").join("b").join("c.txt"), "c", 0o644);
    let root = store.commit(&["r1"], src.path()).await.unwrap();

    // Content addressing makes the subtree digest equal to the digest of committing the
    // subtree on its own.
    let expected = store.commit_directory(&src.path().join("a").join("b")).await.unwrap();
    let resolved = store.subdir_digest(root, "a/b").await.unwrap();
    assert_eq!(resolved, expected);

    match store.subdir_digest(root, "a/nope").await {
        Err(StoreError::SubdirNotFound(_)) => {}
        other => panic!("Want SubdirNotFound, got: {other:?}"),
    }
}

#[tokio::test]
async fn move_atomic_reports_lost_races() {
    let dir = TempDir::new().unwrap();

    let src = dir.path().join("src");
    std::fs::create_dir(&src).unwrap();
    std::fs::write(src.join("winner"), b"first").unwrap();
    let dest = dir.path().join("dest");
    assert_eq!(move_atomic(&src, &dest).await, Ok(true));
    assert!(dest.join("winner").is_file());

    // A second mover finds the destination occupied and backs off without error.
    let src2 = dir.path().join("src2");
    std::fs::create_dir(&src2).unwrap();
    std::fs::write(src2.join("marker"), b"loser").unwrap();
    assert_eq!(move_atomic(&src2, &dest).await, Ok(false));
    assert!(!dest.join("marker").exists());
}
