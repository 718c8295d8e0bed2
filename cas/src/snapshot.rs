// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt};
use hashing::Digest;
use prost::Message;
use protos::remexec;
use protos::require_digest;

use crate::{Store, StoreError};

impl Store {
    ///
    /// Capture a local directory into the store and point every given ref at its root.
    /// Returns the root digest.
    ///
    pub async fn commit(&self, refs: &[&str], path: &Path) -> Result<Digest, StoreError> {
        let tree = self.commit_directory(path).await?;
        for name in refs {
            self.set_ref(name, tree)?;
        }
        Ok(tree)
    }

    ///
    /// Recursively ingests a local directory: every regular file becomes a blob, every
    /// subdirectory a serialized Directory blob. Children are always stored before their
    /// parent, so a stored Directory never references bytes that were not stored first.
    ///
    /// Sockets are skipped (the process serving one cannot be captured anyway); any other
    /// special file fails the commit.
    ///
    pub(crate) fn commit_directory<'a>(
        &'a self,
        path: &'a Path,
    ) -> BoxFuture<'a, Result<Digest, StoreError>> {
        async move {
            let mut read_dir = tokio::fs::read_dir(path)
                .await
                .map_err(|e| format!("Failed to list directory {path:?}: {e}"))?;
            let mut entries: Vec<(String, std::fs::FileType)> = vec![];
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| format!("Error iterating dir {path:?}: {e}"))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| format!("Could not stat {:?}: {e}", entry.path()))?;
                let name = entry.file_name().into_string().map_err(|name| {
                    StoreError::Storage(format!("Non-UTF8 file name {name:?} in {path:?}"))
                })?;
                entries.push((name, file_type));
            }
            // Capture in lexicographic order, so that equal trees serialize identically no
            // matter how the filesystem chose to iterate.
            entries.sort_by(|x, y| x.0.cmp(&y.0));

            let mut directory = remexec::Directory::default();
            for (name, file_type) in entries {
                let full_path = path.join(&name);
                if file_type.is_dir() {
                    let digest = self.commit_directory(&full_path).await?;
                    directory.directories.push(remexec::DirectoryNode {
                        name,
                        digest: Some(digest.into()),
                    });
                } else if file_type.is_file() {
                    let metadata = tokio::fs::symlink_metadata(&full_path)
                        .await
                        .map_err(|e| format!("Could not stat {full_path:?}: {e}"))?;
                    let digest = self.add_object_from_path(&full_path, false).await?;
                    directory.files.push(remexec::FileNode {
                        name,
                        digest: Some(digest.into()),
                        is_executable: metadata.permissions().mode() & 0o100 != 0,
                    });
                } else if file_type.is_symlink() {
                    let target = tokio::fs::read_link(&full_path)
                        .await
                        .map_err(|e| format!("Could not read link {full_path:?}: {e}"))?;
                    let target = target.into_os_string().into_string().map_err(|target| {
                        StoreError::Storage(format!(
                            "Non-UTF8 symlink target {target:?} at {full_path:?}"
                        ))
                    })?;
                    directory
                        .symlinks
                        .push(remexec::SymlinkNode { name, target });
                } else if file_type.is_socket() {
                    // The process serving the socket can't be cached anyway.
                } else {
                    return Err(StoreError::UnsupportedFileType(full_path));
                }
            }

            Ok(self.add_object(&directory.encode_to_vec()).await?)
        }
        .boxed()
    }

    ///
    /// Extract the tree behind a ref into `path/<root-hash>`, if it has not already been
    /// extracted, and return that destination.
    ///
    /// The tree is materialized into a temporary sibling and atomically renamed into place;
    /// losing the rename race to a concurrent extraction of the same artifact is not an error.
    ///
    /// With `subdir`, an existing extraction is completed with just that subtree if it is
    /// missing; a fresh extraction includes it already.
    ///
    pub async fn extract(
        &self,
        name: &str,
        path: &Path,
        subdir: Option<&str>,
    ) -> Result<PathBuf, StoreError> {
        let mut tree = self.resolve_ref(name, true)?;

        let originaldest = path.join(tree.hash.to_hex());
        let mut dest = originaldest.clone();
        if dest.is_dir() {
            match subdir {
                Some(subdir) if !dest.join(subdir).is_dir() => {
                    dest = dest.join(subdir);
                    tree = self.subdir_digest(tree, subdir).await?;
                }
                _ => return Ok(originaldest),
            }
        }

        let tmpdir = tempfile::Builder::new()
            .prefix("tmp")
            .tempdir_in(&self.tmpdir)
            .map_err(|e| format!("Failed to create temporary checkout directory: {e}"))?;
        let checkoutdir = tmpdir.path().join("checkout");
        self.checkout(&checkoutdir, tree).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create {parent:?}: {e}"))?;
        }
        match move_atomic(&checkoutdir, &dest).await {
            Ok(true) => {}
            Ok(false) => {
                // Another process beat us to the rename.
                log::debug!("Lost extraction race for {dest:?}");
            }
            Err(e) => {
                return Err(StoreError::Extraction(format!(
                    "Failed to extract directory for ref '{name}': {e}"
                )))
            }
        }

        Ok(originaldest)
    }

    ///
    /// Materializes the tree rooted at `tree` into `dest`: regular files are hard-linked out
    /// of the object store (and marked executable where recorded), symlinks are recreated with
    /// their stored targets, and subdirectories recurse.
    ///
    /// A child directory whose blob is absent is silently omitted: subset pulls leave such
    /// dangling references behind on purpose.
    ///
    pub(crate) fn checkout<'a>(
        &'a self,
        dest: &'a Path,
        tree: Digest,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            tokio::fs::create_dir_all(dest)
                .await
                .map_err(|e| format!("Failed to create checkout directory {dest:?}: {e}"))?;

            let directory = self.load_directory(tree).await?.ok_or_else(|| {
                StoreError::Storage(format!("Missing directory object {}", tree.hash))
            })?;

            for filenode in &directory.files {
                let digest = require_digest(filenode.digest.as_ref())?;
                let fullpath = dest.join(&filenode.name);
                tokio::fs::hard_link(self.object_path(digest), &fullpath)
                    .await
                    .map_err(|e| {
                        format!("Failed to link {:?} into checkout: {e}", filenode.name)
                    })?;
                if filenode.is_executable {
                    tokio::fs::set_permissions(&fullpath, std::fs::Permissions::from_mode(0o755))
                        .await
                        .map_err(|e| format!("Failed to set permissions on {fullpath:?}: {e}"))?;
                }
            }

            for dirnode in &directory.directories {
                let digest = require_digest(dirnode.digest.as_ref())?;
                // Don't try to check out a dangling reference.
                if self.contains_object(digest).await {
                    let child = dest.join(&dirnode.name);
                    self.checkout(&child, digest).await?;
                }
            }

            for symlinknode in &directory.symlinks {
                tokio::fs::symlink(&symlinknode.target, dest.join(&symlinknode.name))
                    .await
                    .map_err(|e| {
                        format!("Failed to create symlink {:?}: {e}", symlinknode.name)
                    })?;
            }

            Ok(())
        }
        .boxed()
    }
}

/// Moves `src` over `dest` with a single rename. Returns false without touching anything if
/// `dest` already exists (a concurrent mover won the race).
pub(crate) async fn move_atomic(src: &Path, dest: &Path) -> Result<bool, String> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(true),
        Err(_) if dest.is_dir() => Ok(false),
        Err(e) => Err(e.to_string()),
    }
}
