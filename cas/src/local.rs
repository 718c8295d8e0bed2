// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs_set_times::SystemTimeSpec;
use hashing::{Digest, Fingerprint, Hasher};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How many bytes are read per chunk while hashing content into the store.
const HASH_CHUNK_SIZE: usize = 4096;

///
/// The byte-level half of the cache: immutable blobs stored one file per digest under
/// `objects/<hh>/<remaining-62-hex>`, staged through a scratch directory on the same filesystem
/// so that they can be published with `link(2)`.
///
/// Publication is idempotent: linking on top of an existing object is success, because equal
/// names imply equal bytes.
///
#[derive(Clone, Debug)]
pub struct ByteStore {
    objects_root: PathBuf,
    tmp_root: PathBuf,
}

impl ByteStore {
    pub fn new(objects_root: PathBuf, tmp_root: PathBuf) -> Result<ByteStore, String> {
        std::fs::create_dir_all(&objects_root)
            .map_err(|e| format!("Failed to create {}: {e}", objects_root.display()))?;
        std::fs::create_dir_all(&tmp_root)
            .map_err(|e| format!("Failed to create {}: {e}", tmp_root.display()))?;
        Ok(ByteStore {
            objects_root,
            tmp_root,
        })
    }

    /// The path the given digest is (or would be) stored at. Does not check existence.
    pub fn object_path(&self, digest: Digest) -> PathBuf {
        let hex = digest.hash.to_hex();
        self.objects_root.join(&hex[0..2]).join(&hex[2..])
    }

    pub async fn contains(&self, digest: Digest) -> bool {
        tokio::fs::metadata(self.object_path(digest)).await.is_ok()
    }

    /// Refreshes the mtime of a stored object, to bias least-recently-modified orderings.
    /// An object concurrently pruned away is not an error.
    pub async fn touch(&self, digest: Digest) -> Result<(), String> {
        let path = self.object_path(digest);
        tokio::task::spawn_blocking(move || {
            match fs_set_times::set_mtime(&path, SystemTimeSpec::SymbolicNow) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(format!("Failed to update mtime of {path:?}: {e}")),
            }
        })
        .await
        .map_err(|e| format!("`touch` task failed: {e}"))?
    }

    ///
    /// Store the given bytes, returning their digest.
    ///
    pub async fn add_buffer(&self, bytes: &[u8]) -> Result<Digest, String> {
        let digest = Digest::of_bytes(bytes);
        let tmp = self.stage_tempfile()?;
        tokio::fs::write(tmp.path(), bytes)
            .await
            .map_err(|e| format!("Failed to write {:?}: {e}", tmp.path()))?;
        self.place(tmp.path(), digest).await?;
        Ok(digest)
    }

    ///
    /// Store the file at `src`, returning its digest.
    ///
    /// With `link_directly` the caller asserts that `src` is immutable and already lives on the
    /// store's filesystem; the bytes are hashed in place and `src` itself is linked into the
    /// store. Otherwise the content is streamed into a staging file while being hashed, so a
    /// concurrent writer to `src` cannot corrupt the store.
    ///
    pub async fn add_path(&self, src: &Path, link_directly: bool) -> Result<Digest, String> {
        let mut src_file = tokio::fs::File::open(src)
            .await
            .map_err(|e| format!("Failed to open {src:?}: {e}"))?;

        if link_directly {
            let mut sink = tokio::io::sink();
            let digest = copy_and_hash_chunked(&mut src_file, &mut sink)
                .await
                .map_err(|e| format!("Failed to hash {src:?}: {e}"))?;
            self.place(src, digest).await?;
            Ok(digest)
        } else {
            let tmp = self.stage_tempfile()?;
            let mut dst = tokio::fs::OpenOptions::new()
                .write(true)
                .open(tmp.path())
                .await
                .map_err(|e| format!("Failed to reopen {:?}: {e}", tmp.path()))?;
            let digest = copy_and_hash_chunked(&mut src_file, &mut dst)
                .await
                .map_err(|e| format!("Failed to hash {src:?}: {e}"))?;
            dst.flush()
                .await
                .map_err(|e| format!("Failed to flush {:?}: {e}", tmp.path()))?;
            self.place(tmp.path(), digest).await?;
            Ok(digest)
        }
    }

    /// Creates a staging file in the scratch directory. Objects must stay group/world readable
    /// once linked into place, so widen the 0600 that NamedTempFile starts from.
    pub(crate) fn stage_tempfile(&self) -> Result<NamedTempFile, String> {
        let tmp = NamedTempFile::new_in(&self.tmp_root).map_err(|e| {
            format!(
                "Failed to create temporary file in {}: {e}",
                self.tmp_root.display()
            )
        })?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
            .map_err(|e| format!("Failed to set permissions on {:?}: {e}", tmp.path()))?;
        Ok(tmp)
    }

    /// Publishes the file at `src` as the storage for `digest` via `link(2)`.
    pub(crate) async fn place(&self, src: &Path, digest: Digest) -> Result<(), String> {
        let dest = self.object_path(digest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create object shard directory {parent:?}: {e}"))?;
        }
        match tokio::fs::hard_link(src, &dest).await {
            Ok(()) => Ok(()),
            // The object is already in the repository; equal names imply equal bytes.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(format!("Failed to link object into place at {dest:?}: {e}")),
        }
    }

    ///
    /// Walks every object in the store, calling `f` with the fingerprint parsed from the path,
    /// the path itself, and its metadata. Entries that disappear mid-walk are skipped, as are
    /// stray files whose names do not parse as fingerprints.
    ///
    /// Blocking; run under `spawn_blocking`.
    ///
    pub(crate) fn walk_objects_sync<F>(&self, mut f: F) -> Result<(), String>
    where
        F: FnMut(Fingerprint, &Path, &std::fs::Metadata) -> Result<(), String>,
    {
        let root = &self.objects_root;
        let shards = match std::fs::read_dir(root) {
            Ok(shards) => shards,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(format!("Error listing dir {root:?}: {e}")),
        };
        for entry in shards {
            let shard = entry.map_err(|e| format!("Error iterating dir {root:?}: {e}"))?;
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let shard_path = shard.path();
            let objects = std::fs::read_dir(&shard_path)
                .map_err(|e| format!("Failed to read shard directory {shard_path:?}: {e}"))?;
            for entry in objects {
                let object =
                    entry.map_err(|e| format!("Error iterating dir {shard_path:?}: {e}"))?;
                let name = format!(
                    "{}{}",
                    shard.file_name().to_string_lossy(),
                    object.file_name().to_string_lossy()
                );
                let fingerprint = match Fingerprint::from_hex_string(&name) {
                    Ok(fingerprint) => fingerprint,
                    Err(_) => continue,
                };
                let metadata = match object.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(format!(
                            "Could not access metadata for {:?}: {e}",
                            object.path()
                        ))
                    }
                };
                f(fingerprint, &object.path(), &metadata)?;
            }
        }
        Ok(())
    }
}

/// Copies `reader` into `writer` in `HASH_CHUNK_SIZE` chunks, returning the digest of the
/// copied bytes.
async fn copy_and_hash_chunked<R, W>(reader: &mut R, writer: &mut W) -> tokio::io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Hasher::new();
    let mut buf = [0_u8; HASH_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[0..n]);
        writer.write_all(&buf[0..n]).await?;
    }
    Ok(hasher.finish())
}
