// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! A content-addressed store of build artifacts, following the Remote Execution API v2 data
//! model.
//!
//! Blobs are immutable byte sequences named by the hex SHA-256 of their content and stored one
//! file per blob. Filesystem trees are described by serialized [`protos::remexec::Directory`]
//! messages, which are themselves blobs, so a whole tree is named by the digest of its root.
//! Mutable, named entry points into the store ("refs") map string keys to root digests.
//!
//! A [`Store`] is a handle bound to one cache root on disk; it holds no locks and no global
//! state. Consistency between concurrent users relies on the atomicity of `link(2)` and
//! `rename(2)` only.

mod local;
mod remote;
mod snapshot;
#[cfg(test)]
mod snapshot_tests;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::future::{BoxFuture, FutureExt};
use hashing::{Digest, Fingerprint};
use prost::Message;
use protos::remexec;
use protos::require_digest;

pub use crate::local::ByteStore;
pub use crate::remote::{CasRemote, LoadDestination};

///
/// The failure modes of cache operations. All mutating steps are individually atomic, so any
/// of these leaves the cache in a consistent state.
///
#[derive(Debug, PartialEq)]
pub enum StoreError {
    /// An unexpected filesystem error while reading or mutating the cache.
    Storage(String),
    /// The named ref does not exist.
    RefNotFound(String),
    /// A path walk into a tree did not resolve.
    SubdirNotFound(String),
    /// A directory entry of a kind that cannot be captured (device, FIFO, ...).
    UnsupportedFileType(PathBuf),
    /// An extraction failed for a reason other than losing an atomic-rename race.
    Extraction(String),
    /// A pull failed with an RPC error other than NOT_FOUND.
    Pull(String),
    /// A push failed with an RPC error other than NOT_FOUND and RESOURCE_EXHAUSTED. Such
    /// failures are usually worth retrying later.
    Push { message: String, temporary: bool },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(s) => write!(f, "{s}"),
            Self::RefNotFound(name) => {
                write!(f, "Attempt to access unavailable ref: {name}")
            }
            Self::SubdirNotFound(s) => write!(f, "{s}"),
            Self::UnsupportedFileType(path) => {
                write!(f, "Unsupported file type for {}", path.display())
            }
            Self::Extraction(s) => write!(f, "{s}"),
            Self::Pull(s) => write!(f, "{s}"),
            Self::Push { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        Self::Storage(err)
    }
}

/// The result of a structural comparison of two trees: file paths relative to the compared
/// roots, in the order the merge walk encountered them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeDiff {
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

///
/// A content-addressed cache rooted at one directory:
///
/// ```text
/// <root>/
///   cas/
///     objects/<hh>/<remaining-62-hex>
///     refs/heads/<arbitrary/ref/key>
///   tmp/
/// ```
///
/// `tmp/` lives on the same filesystem as `cas/` so that staged files can be published into
/// `objects/` with `link(2)`.
///
#[derive(Clone, Debug)]
pub struct Store {
    casdir: PathBuf,
    tmpdir: PathBuf,
    objects: ByteStore,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Store, String> {
        let root = path.as_ref();
        let casdir = root.join("cas");
        let tmpdir = root.join("tmp");
        std::fs::create_dir_all(casdir.join("refs").join("heads"))
            .map_err(|e| format!("Failed to create {}: {e}", casdir.display()))?;
        let objects = ByteStore::new(casdir.join("objects"), tmpdir.clone())?;
        Ok(Store {
            casdir,
            tmpdir,
            objects,
        })
    }

    /// Checks that the on-disk repository layout is present and usable.
    pub fn preflight(&self) -> Result<(), StoreError> {
        let headdir = self.refs_root();
        let objdir = self.casdir.join("objects");
        if !(headdir.is_dir() && objdir.is_dir()) {
            return Err(StoreError::Storage(format!(
                "CAS repository check failed for {:?}",
                self.casdir
            )));
        }
        Ok(())
    }

    pub fn object_path(&self, digest: Digest) -> PathBuf {
        self.objects.object_path(digest)
    }

    pub async fn contains_object(&self, digest: Digest) -> bool {
        self.objects.contains(digest).await
    }

    ///
    /// Hash and store the given bytes, returning their digest.
    ///
    pub async fn add_object(&self, bytes: &[u8]) -> Result<Digest, StoreError> {
        Ok(self.objects.add_buffer(bytes).await?)
    }

    ///
    /// Hash and store the file at `path`, returning its digest. See
    /// [`ByteStore::add_path`] for the meaning of `link_directly`.
    ///
    pub async fn add_object_from_path(
        &self,
        path: &Path,
        link_directly: bool,
    ) -> Result<Digest, StoreError> {
        Ok(self.objects.add_path(path, link_directly).await?)
    }

    ///
    /// Refresh the mtime of every object reachable from the given tree root, to protect a
    /// still-useful artifact from least-recently-modified eviction policies.
    ///
    pub async fn update_tree_mtime(&self, tree: Digest) -> Result<(), StoreError> {
        let mut reachable = HashSet::new();
        self.walk_reachable(&mut reachable, tree, true).await
    }

    //
    // Refs
    //

    fn refs_root(&self) -> PathBuf {
        self.casdir.join("refs").join("heads")
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.refs_root().join(name)
    }

    /// Whether the given ref exists. Assumes the repository has no dangling refs.
    pub fn contains(&self, name: &str) -> bool {
        self.ref_path(name).exists()
    }

    ///
    /// Create or replace a ref. The write is atomic: a staged file is fsynced and renamed into
    /// place, so concurrent readers observe either the old digest or the new one.
    ///
    pub fn set_ref(&self, name: &str, tree: Digest) -> Result<(), StoreError> {
        let refpath = self.ref_path(name);
        if let Some(parent) = refpath.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create ref directory {parent:?}: {e}"))?;
        }
        let tmp = tempfile::NamedTempFile::new_in(&self.tmpdir)
            .map_err(|e| format!("Failed to create temporary ref file: {e}"))?;
        let proto: remexec::Digest = tree.into();
        {
            let mut file = tmp.as_file();
            io::Write::write_all(&mut file, &proto.encode_to_vec())
                .map_err(|e| format!("Failed to write ref {name}: {e}"))?;
            file.sync_all()
                .map_err(|e| format!("Failed to sync ref {name}: {e}"))?;
        }
        tmp.persist(&refpath)
            .map_err(|e| format!("Failed to persist ref {name}: {e}"))?;
        Ok(())
    }

    ///
    /// Resolve a ref to the digest it points at, optionally refreshing its mtime for
    /// least-recently-modified orderings.
    ///
    pub fn resolve_ref(&self, name: &str, update_mtime: bool) -> Result<Digest, StoreError> {
        let refpath = self.ref_path(name);
        let bytes = match std::fs::read(&refpath) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RefNotFound(name.to_owned()))
            }
            Err(e) => return Err(format!("Failed to read ref {name}: {e}").into()),
        };
        if update_mtime {
            fs_set_times::set_mtime(&refpath, fs_set_times::SystemTimeSpec::SymbolicNow)
                .map_err(|e| format!("Failed to update mtime of ref {name}: {e}"))?;
        }
        let proto = remexec::Digest::decode(bytes.as_slice())
            .map_err(|e| format!("Ref {name} does not hold a serialized digest: {e}"))?;
        let digest = (&proto)
            .try_into()
            .map_err(|e: String| format!("Ref {name} holds an invalid digest: {e}"))?;
        Ok(digest)
    }

    /// Refresh the mtime of a ref.
    pub fn update_mtime(&self, name: &str) -> Result<(), StoreError> {
        match fs_set_times::set_mtime(
            self.ref_path(name),
            fs_set_times::SystemTimeSpec::SymbolicNow,
        ) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::RefNotFound(name.to_owned()))
            }
            Err(e) => Err(format!("Failed to update mtime of ref {name}: {e}").into()),
        }
    }

    /// Add an alias for an existing ref.
    pub fn link_ref(&self, oldref: &str, newref: &str) -> Result<(), StoreError> {
        let tree = self.resolve_ref(oldref, false)?;
        self.set_ref(newref, tree)
    }

    /// List refs, least recently modified first.
    pub async fn list_refs(&self) -> Result<Vec<String>, StoreError> {
        let heads = self.refs_root();
        let refs = tokio::task::spawn_blocking(move || {
            let mut refs: Vec<(SystemTime, String)> = vec![];
            walk_files(&heads, &mut |path, metadata| {
                let name = path
                    .strip_prefix(&heads)
                    .map_err(|e| format!("Ref path {path:?} outside of {heads:?}: {e}"))?
                    .to_str()
                    .ok_or_else(|| format!("Non-UTF8 ref name at {path:?}"))?
                    .to_owned();
                let mtime = metadata
                    .modified()
                    .map_err(|e| format!("Could not read mtime of {path:?}: {e}"))?;
                refs.push((mtime, name));
                Ok(())
            })?;
            refs.sort();
            Ok::<_, String>(refs.into_iter().map(|(_, name)| name).collect())
        })
        .await
        .map_err(|e| format!("`list_refs` task failed: {e}"))??;
        Ok(refs)
    }

    /// List stored objects with their mtimes, least recently modified first.
    pub async fn list_objects(&self) -> Result<Vec<(SystemTime, PathBuf)>, StoreError> {
        let objects = self.objects.clone();
        let listed = tokio::task::spawn_blocking(move || {
            let mut listed: Vec<(SystemTime, PathBuf)> = vec![];
            objects.walk_objects_sync(|_, path, metadata| {
                let mtime = metadata
                    .modified()
                    .map_err(|e| format!("Could not read mtime of {path:?}: {e}"))?;
                listed.push((mtime, path.to_owned()));
                Ok(())
            })?;
            listed.sort();
            Ok::<_, String>(listed)
        })
        .await
        .map_err(|e| format!("`list_objects` task failed: {e}"))??;
        Ok(listed)
    }

    /// Delete every ref whose mtime is strictly older than `time`.
    pub async fn clean_up_refs_until(&self, time: SystemTime) -> Result<(), StoreError> {
        let heads = self.refs_root();
        tokio::task::spawn_blocking(move || {
            walk_files(&heads, &mut |path, metadata| {
                let mtime = metadata
                    .modified()
                    .map_err(|e| format!("Could not read mtime of {path:?}: {e}"))?;
                if mtime < time {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(format!("Failed to remove ref {path:?}: {e}")),
                    }
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| format!("`clean_up_refs_until` task failed: {e}"))??;
        Ok(())
    }

    ///
    /// Remove a ref. Unless `defer_prune` is set, unreachable objects are garbage collected
    /// immediately and the number of bytes freed is returned.
    ///
    pub async fn remove(&self, name: &str, defer_prune: bool) -> Result<Option<usize>, StoreError> {
        let refpath = self.ref_path(name);
        match std::fs::remove_file(&refpath) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RefNotFound(name.to_owned()))
            }
            Err(e) => return Err(format!("Failed to remove ref {name}: {e}").into()),
        }

        if defer_prune {
            Ok(None)
        } else {
            Ok(Some(self.prune().await?))
        }
    }

    //
    // Trees
    //

    /// Reads and decodes the Directory stored under `digest`, or None if the blob is absent.
    pub(crate) async fn load_directory(
        &self,
        digest: Digest,
    ) -> Result<Option<remexec::Directory>, StoreError> {
        let path = self.objects.object_path(digest);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("Failed to read object {path:?}: {e}").into()),
        };
        let directory = remexec::Directory::decode(bytes.as_slice()).map_err(|e| {
            StoreError::Storage(format!(
                "Object {} is not a valid Directory: {e}",
                digest.hash
            ))
        })?;
        Ok(Some(directory))
    }

    ///
    /// Resolve a `head/tail` style path to the digest of the subdirectory it names, starting
    /// from the given tree root. Fails with `SubdirNotFound` if any component is missing, or if
    /// an intermediate Directory blob is not present locally (a dangling tree).
    ///
    pub(crate) async fn subdir_digest(
        &self,
        tree: Digest,
        subdir: &str,
    ) -> Result<Digest, StoreError> {
        let mut current = tree;
        for component in subdir.split('/').filter(|c| !c.is_empty()) {
            let directory = self.load_directory(current).await?.ok_or_else(|| {
                StoreError::SubdirNotFound(format!("Subdirectory {component} not found"))
            })?;
            let dirnode = directory
                .directories
                .iter()
                .find(|dirnode| dirnode.name == component)
                .ok_or_else(|| {
                    StoreError::SubdirNotFound(format!("Subdirectory {component} not found"))
                })?;
            current = require_digest(dirnode.digest.as_ref())?;
        }
        Ok(current)
    }

    ///
    /// Whether the tree behind the given ref has the named subdirectory populated locally,
    /// i.e. present and not a dangling reference.
    ///
    pub async fn contains_subdir_artifact(
        &self,
        name: &str,
        subdir: &str,
    ) -> Result<bool, StoreError> {
        let tree = self.resolve_ref(name, false)?;
        match self.subdir_digest(tree, subdir).await {
            Ok(digest) => Ok(self.objects.contains(digest).await),
            Err(StoreError::SubdirNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    ///
    /// Structurally compare the trees behind two refs, optionally narrowed to a subdirectory.
    /// Symlinks are not compared.
    ///
    pub async fn diff(
        &self,
        ref_a: &str,
        ref_b: &str,
        subdir: Option<&str>,
    ) -> Result<TreeDiff, StoreError> {
        let mut tree_a = self.resolve_ref(ref_a, false)?;
        let mut tree_b = self.resolve_ref(ref_b, false)?;

        if let Some(subdir) = subdir {
            tree_a = self.subdir_digest(tree_a, subdir).await?;
            tree_b = self.subdir_digest(tree_b, subdir).await?;
        }

        let mut diff = TreeDiff::default();
        self.diff_trees(Some(tree_a), Some(tree_b), String::new(), &mut diff)
            .await?;
        Ok(diff)
    }

    fn diff_trees<'a>(
        &'a self,
        tree_a: Option<Digest>,
        tree_b: Option<Digest>,
        prefix: String,
        diff: &'a mut TreeDiff,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let dir_a = self.load_directory_or_empty(tree_a).await?;
            let dir_b = self.load_directory_or_empty(tree_b).await?;

            let mut a = 0;
            let mut b = 0;
            while a < dir_a.files.len() || b < dir_b.files.len() {
                if b < dir_b.files.len()
                    && (a >= dir_a.files.len() || dir_a.files[a].name > dir_b.files[b].name)
                {
                    diff.added.push(join_path(&prefix, &dir_b.files[b].name));
                    b += 1;
                } else if a < dir_a.files.len()
                    && (b >= dir_b.files.len() || dir_b.files[b].name > dir_a.files[a].name)
                {
                    diff.removed.push(join_path(&prefix, &dir_a.files[a].name));
                    a += 1;
                } else {
                    // The file exists on both sides; equal hashes mean equal content.
                    if node_hash(dir_a.files[a].digest.as_ref())
                        != node_hash(dir_b.files[b].digest.as_ref())
                    {
                        diff.modified.push(join_path(&prefix, &dir_a.files[a].name));
                    }
                    a += 1;
                    b += 1;
                }
            }

            let mut a = 0;
            let mut b = 0;
            while a < dir_a.directories.len() || b < dir_b.directories.len() {
                if b < dir_b.directories.len()
                    && (a >= dir_a.directories.len()
                        || dir_a.directories[a].name > dir_b.directories[b].name)
                {
                    let node = &dir_b.directories[b];
                    let child = require_digest(node.digest.as_ref())?;
                    self.diff_trees(
                        None,
                        Some(child),
                        join_path(&prefix, &node.name),
                        &mut *diff,
                    )
                    .await?;
                    b += 1;
                } else if a < dir_a.directories.len()
                    && (b >= dir_b.directories.len()
                        || dir_b.directories[b].name > dir_a.directories[a].name)
                {
                    let node = &dir_a.directories[a];
                    let child = require_digest(node.digest.as_ref())?;
                    self.diff_trees(
                        Some(child),
                        None,
                        join_path(&prefix, &node.name),
                        &mut *diff,
                    )
                    .await?;
                    a += 1;
                } else {
                    // The subdirectory exists on both sides; identical digests guarantee
                    // identical contents, so only differing subtrees are descended into.
                    let node_a = &dir_a.directories[a];
                    let node_b = &dir_b.directories[b];
                    if node_hash(node_a.digest.as_ref()) != node_hash(node_b.digest.as_ref()) {
                        let child_a = require_digest(node_a.digest.as_ref())?;
                        let child_b = require_digest(node_b.digest.as_ref())?;
                        self.diff_trees(
                            Some(child_a),
                            Some(child_b),
                            join_path(&prefix, &node_a.name),
                            &mut *diff,
                        )
                        .await?;
                    }
                    a += 1;
                    b += 1;
                }
            }

            Ok(())
        }
        .boxed()
    }

    async fn load_directory_or_empty(
        &self,
        tree: Option<Digest>,
    ) -> Result<remexec::Directory, StoreError> {
        match tree {
            Some(digest) => self.load_directory(digest).await?.ok_or_else(|| {
                StoreError::Storage(format!("Missing directory object {}", digest.hash))
            }),
            None => Ok(remexec::Directory::default()),
        }
    }

    //
    // Garbage collection
    //

    ///
    /// Remove every object not reachable from any ref, returning the number of bytes freed.
    ///
    /// Not safe to run concurrently with writers to the same cache root; collection is a
    /// quiescent-phase operation.
    ///
    pub async fn prune(&self) -> Result<usize, StoreError> {
        let mut reachable: HashSet<Fingerprint> = HashSet::new();
        for name in self.list_refs().await? {
            let tree = self.resolve_ref(&name, false)?;
            self.walk_reachable(&mut reachable, tree, false).await?;
        }

        let objects = self.objects.clone();
        let pruned = tokio::task::spawn_blocking(move || {
            let mut pruned: usize = 0;
            objects.walk_objects_sync(|fingerprint, path, metadata| {
                if !reachable.contains(&fingerprint) {
                    match std::fs::remove_file(path) {
                        Ok(()) => pruned += metadata.len() as usize,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(format!(
                                "Failed to unlink unreachable object {path:?}: {e}"
                            ))
                        }
                    }
                }
                Ok(())
            })?;
            Ok::<_, String>(pruned)
        })
        .await
        .map_err(|e| format!("`prune` task failed: {e}"))??;

        log::debug!("Pruned {pruned} bytes of unreachable objects");
        Ok(pruned)
    }

    ///
    /// Walks the tree rooted at `tree`, accumulating the fingerprints of every visited blob.
    /// Shared subtrees are visited once. A dangling tree is traversed as far as it is present.
    ///
    async fn walk_reachable(
        &self,
        reachable: &mut HashSet<Fingerprint>,
        tree: Digest,
        update_mtime: bool,
    ) -> Result<(), StoreError> {
        let mut queue = vec![tree];
        while let Some(digest) = queue.pop() {
            if reachable.contains(&digest.hash) {
                continue;
            }
            if update_mtime {
                self.objects.touch(digest).await?;
            }
            reachable.insert(digest.hash);

            let Some(directory) = self.load_directory(digest).await? else {
                continue;
            };
            for filenode in &directory.files {
                let file_digest = require_digest(filenode.digest.as_ref())?;
                if update_mtime {
                    self.objects.touch(file_digest).await?;
                }
                reachable.insert(file_digest.hash);
            }
            for dirnode in &directory.directories {
                queue.push(require_digest(dirnode.digest.as_ref())?);
            }
        }
        Ok(())
    }

    /// The real disk usage of the cache: objects plus refs.
    pub async fn calculate_cache_size(&self) -> Result<usize, StoreError> {
        let casdir = self.casdir.clone();
        let size = tokio::task::spawn_blocking(move || {
            let mut size: usize = 0;
            walk_files(&casdir, &mut |_, metadata| {
                size += metadata.len() as usize;
                Ok(())
            })?;
            Ok::<_, String>(size)
        })
        .await
        .map_err(|e| format!("`calculate_cache_size` task failed: {e}"))??;
        Ok(size)
    }
}

/// Recursively applies `f` to every file under `root` with its metadata. Files that disappear
/// mid-walk are skipped. A missing `root` yields nothing.
fn walk_files(
    root: &Path,
    f: &mut dyn FnMut(&Path, &std::fs::Metadata) -> Result<(), String>,
) -> Result<(), String> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(format!("Error listing dir {root:?}: {e}")),
    };
    for entry in entries {
        let entry = entry.map_err(|e| format!("Error iterating dir {root:?}: {e}"))?;
        let file_type = entry
            .file_type()
            .map_err(|e| format!("Could not stat {:?}: {e}", entry.path()))?;
        if file_type.is_dir() {
            walk_files(&entry.path(), f)?;
        } else {
            match entry.metadata() {
                Ok(metadata) => f(&entry.path(), &metadata)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(format!("Could not access metadata for {:?}: {e}", entry.path()))
                }
            }
        }
    }
    Ok(())
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}/{name}")
    }
}

fn node_hash(digest: Option<&remexec::Digest>) -> Option<&str> {
    digest.map(|d| d.hash.as_str())
}
