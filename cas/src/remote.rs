// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use hashing::{Digest, Fingerprint};
use prost::Message;
use protos::remexec;
use protos::{require_digest, verify_directory_canonical};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tonic::{Code, Status};
use uuid::Uuid;

use crate::{Store, StoreError};

/// Upper bound on the number of digests named in one FindMissingBlobs request.
const FIND_MISSING_GROUP_SIZE: usize = 512;

///
/// The RPC surface the cache consumes from a remote CAS server. Transports implement this;
/// the sync algorithms in this module are written against it.
///
/// Every RPC reports failure as a `tonic::Status`; `NOT_FOUND` and `RESOURCE_EXHAUSTED` get
/// special treatment from the callers in this module, everything else is surfaced.
///
#[async_trait]
pub trait CasRemote: Send + Sync {
    /// The server-advertised maximum total size of one batch RPC, in bytes.
    fn max_batch_total_size_bytes(&self) -> usize;
    /// Whether the server advertises the batched read RPC.
    fn batch_read_supported(&self) -> bool;
    /// Whether the server advertises the batched update RPC.
    fn batch_update_supported(&self) -> bool;

    /// Resolve a symbolic ref on the server. Absence is a `NOT_FOUND` status.
    async fn get_reference(&self, key: &str) -> Result<Digest, Status>;

    /// Point every given key at the given directory root digest.
    async fn update_reference(&self, keys: &[&str], digest: Digest) -> Result<(), Status>;

    /// Of `digests`, return those the server does not have.
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status>;

    /// Upload a group of small blobs in one RPC.
    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Status>;

    /// Download a group of small blobs in one RPC. A blob missing on the server fails the
    /// whole batch with `NOT_FOUND`.
    async fn batch_read_blobs(&self, digests: Vec<Digest>) -> Result<Vec<(Digest, Bytes)>, Status>;

    /// Stream a single blob from the server into `destination`.
    async fn read_blob(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<(), Status>;

    /// Stream a single blob to the server. `u_uid` namespaces the upload resource name.
    async fn write_blob(
        &self,
        digest: Digest,
        u_uid: Uuid,
        file: tokio::fs::File,
    ) -> Result<(), Status>;
}

/// Places that write the result of a remote blob read.
#[async_trait]
pub trait LoadDestination: AsyncWrite + Send + Sync + Unpin + 'static {
    /// Clear out the writer and start again, if there's been previous contents written.
    async fn reset(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl LoadDestination for tokio::fs::File {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.rewind().await?;
        self.set_len(0).await
    }
}

#[async_trait]
impl LoadDestination for Vec<u8> {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.clear();
        Ok(())
    }
}

/// An error from a sync operation: either a failed RPC, or a local failure.
#[derive(Debug)]
enum RemoteError {
    Grpc(Status),
    Other(String),
}

impl From<Status> for RemoteError {
    fn from(status: Status) -> RemoteError {
        RemoteError::Grpc(status)
    }
}

impl From<String> for RemoteError {
    fn from(string: String) -> RemoteError {
        RemoteError::Other(string)
    }
}

fn status_to_str(status: &Status) -> String {
    format!("{:?}: {:?}", status.code(), status.message())
}

/// Accumulates digests for one batched read, respecting the server's total-size limit.
#[derive(Default)]
struct ReadBatch {
    digests: Vec<Digest>,
    total_size_bytes: usize,
}

impl ReadBatch {
    fn add(&mut self, max_total_size_bytes: usize, digest: Digest) -> bool {
        let new_size = self.total_size_bytes + digest.size_bytes;
        if new_size > max_total_size_bytes {
            return false;
        }
        self.total_size_bytes = new_size;
        self.digests.push(digest);
        true
    }

    fn take(&mut self) -> Vec<Digest> {
        self.total_size_bytes = 0;
        std::mem::take(&mut self.digests)
    }
}

/// Accumulates blobs for one batched update, respecting the server's total-size limit.
#[derive(Default)]
struct UpdateBatch {
    blobs: Vec<(Digest, Bytes)>,
    total_size_bytes: usize,
}

impl UpdateBatch {
    fn add(&mut self, max_total_size_bytes: usize, digest: Digest, bytes: Bytes) -> bool {
        let new_size = self.total_size_bytes + digest.size_bytes;
        if new_size > max_total_size_bytes {
            return false;
        }
        self.total_size_bytes = new_size;
        self.blobs.push((digest, bytes));
        true
    }

    fn take(&mut self) -> Vec<(Digest, Bytes)> {
        self.total_size_bytes = 0;
        std::mem::take(&mut self.blobs)
    }
}

impl Store {
    ///
    /// Pull a ref from a remote repository, storing every blob of its tree locally and then
    /// pointing the local ref at it.
    ///
    /// Returns false, without error, if the server does not know the ref or is missing blobs
    /// of its tree.
    ///
    /// If the tree root is already cached and `subdir` is given, only that subtree is fetched.
    /// `excluded_subdirs` names immediate children of the root to skip; they are left behind
    /// as dangling references that checkout and a later completing pull both understand.
    ///
    pub async fn pull(
        &self,
        name: &str,
        remote: &dyn CasRemote,
        subdir: Option<&str>,
        excluded_subdirs: &[String],
    ) -> Result<bool, StoreError> {
        let tree = match remote.get_reference(name).await {
            Ok(tree) => tree,
            Err(status) if status.code() == Code::NotFound => return Ok(false),
            Err(status) => {
                return Err(StoreError::Pull(format!(
                    "Failed to pull ref {name}: {}",
                    status_to_str(&status)
                )))
            }
        };

        let root_cached = self.contains_object(tree).await;
        let fetched = match subdir {
            // The artifact root is already cached; just fetch the missing subtree.
            Some(subdir) if root_cached => {
                let subdir_digest = self.subdir_digest(tree, subdir).await?;
                self.fetch_directory(remote, subdir_digest, &[]).await
            }
            _ => self.fetch_directory(remote, tree, excluded_subdirs).await,
        };

        match fetched {
            Ok(()) => {
                self.set_ref(name, tree)?;
                Ok(true)
            }
            Err(RemoteError::Grpc(status)) if status.code() == Code::NotFound => Ok(false),
            Err(RemoteError::Grpc(status)) => Err(StoreError::Pull(format!(
                "Failed to pull ref {name}: {}",
                status_to_str(&status)
            ))),
            Err(RemoteError::Other(msg)) => Err(msg.into()),
        }
    }

    ///
    /// Pull a single REv2 `Tree` message rather than a ref; local refs are not updated.
    /// Returns the digest of the re-serialized root Directory, or None if the server does not
    /// have the tree.
    ///
    pub async fn pull_tree(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
    ) -> Result<Option<Digest>, StoreError> {
        match self.fetch_tree(remote, digest).await {
            Ok(root) => Ok(Some(root)),
            Err(RemoteError::Grpc(status)) if status.code() == Code::NotFound => Ok(None),
            Err(RemoteError::Grpc(status)) => Err(StoreError::Pull(format!(
                "Failed to pull tree {:?}: {}",
                digest,
                status_to_str(&status)
            ))),
            Err(RemoteError::Other(msg)) => Err(msg.into()),
        }
    }

    ///
    /// Push committed refs to a remote repository. Returns whether any ref actually needed to
    /// be pushed; refs already on the server with the same tree are skipped, and a throttling
    /// server (`RESOURCE_EXHAUSTED`) silently ends the push so that a scheduler may retry
    /// later.
    ///
    pub async fn push(&self, refs: &[&str], remote: &dyn CasRemote) -> Result<bool, StoreError> {
        let mut pushed = false;
        for &name in refs {
            let tree = self.resolve_ref(name, false)?;

            // If the server already has this ref with the same tree there is nothing to push.
            match remote.get_reference(name).await {
                Ok(existing) if existing == tree => {
                    log::debug!("Ref {name} is already up to date on the server");
                    continue;
                }
                Ok(_) => {}
                Err(status) if status.code() == Code::NotFound => {}
                Err(status) if status.code() == Code::ResourceExhausted => return Ok(pushed),
                Err(status) => return Err(push_error(refs, &status)),
            }

            let sent: Result<(), RemoteError> = async {
                self.send_directory(remote, tree).await?;
                remote.update_reference(&[name], tree).await?;
                Ok(())
            }
            .await;
            match sent {
                Ok(()) => pushed = true,
                Err(RemoteError::Grpc(status)) if status.code() == Code::ResourceExhausted => {
                    return Ok(pushed)
                }
                Err(RemoteError::Grpc(status)) => return Err(push_error(refs, &status)),
                Err(RemoteError::Other(msg)) => return Err(msg.into()),
            }
        }
        Ok(pushed)
    }

    ///
    /// Push the tree rooted at the given digest to a remote, without touching any ref.
    ///
    pub async fn push_directory(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
    ) -> Result<(), StoreError> {
        self.send_directory(remote, digest)
            .await
            .map_err(|e| match e {
                RemoteError::Grpc(status) => StoreError::Push {
                    message: format!(
                        "Failed to push directory {:?}: {}",
                        digest,
                        status_to_str(&status)
                    ),
                    temporary: true,
                },
                RemoteError::Other(msg) => StoreError::Storage(msg),
            })
    }

    ///
    /// Fetch and store a blob if it is not already local, returning its object path.
    ///
    async fn ensure_blob(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
    ) -> Result<PathBuf, RemoteError> {
        let objpath = self.object_path(digest);
        if self.contains_object(digest).await {
            // Already in the local repository.
            return Ok(objpath);
        }

        let tmp = self.stage_download_file()?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to open {tmp:?}: {e}")))?;
        remote.read_blob(digest, &mut file).await?;
        file.shutdown()
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to flush {tmp:?}: {e}")))?;
        // Sync so the link below sees fully-persisted metadata.
        file.sync_all()
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to sync {tmp:?}: {e}")))?;
        drop(file);

        let added = self.add_object_from_path(&tmp, true).await.map_err(|e| {
            RemoteError::Other(format!("Failed to store fetched blob {digest:?}: {e}"))
        })?;
        if added.hash != digest.hash {
            return Err(RemoteError::Other(format!(
                "Remote CAS returned wrong bytes: expected {digest:?}, got {added:?}"
            )));
        }
        Ok(objpath)
    }

    /// Creates a 0644 staging file in the scratch directory for a download, deleted on drop.
    fn stage_download_file(&self) -> Result<tempfile::TempPath, RemoteError> {
        let tmp = self
            .objects
            .stage_tempfile()
            .map_err(RemoteError::Other)?;
        Ok(tmp.into_temp_path())
    }

    /// Downloads everything in the pending batch into the store, then promotes deferred
    /// directories to the walkable queue.
    async fn flush_read_batch(
        &self,
        remote: &dyn CasRemote,
        batch: &mut ReadBatch,
        fetch_queue: &mut VecDeque<Digest>,
        fetch_next_queue: &mut Vec<Digest>,
    ) -> Result<(), RemoteError> {
        let digests = batch.take();
        if !digests.is_empty() {
            let blobs = remote.batch_read_blobs(digests).await?;
            for (digest, data) in blobs {
                let added = self
                    .objects
                    .add_buffer(&data)
                    .await
                    .map_err(RemoteError::Other)?;
                if added != digest {
                    return Err(RemoteError::Other(format!(
                        "Remote CAS returned wrong bytes: expected {digest:?}, got {added:?}"
                    )));
                }
            }
        }

        // All previously scheduled directories are now locally available.
        fetch_queue.extend(fetch_next_queue.drain(..));
        Ok(())
    }

    /// Schedules one tree node for download: already-local nodes cost nothing, oversized (or
    /// batch-unsupported) nodes download immediately, everything else accumulates into the
    /// pending batch. Directories go to the walkable queue once their bytes are local, or to
    /// the deferred queue when they are riding in the pending batch.
    async fn fetch_directory_node(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
        batch: &mut ReadBatch,
        fetch_queue: &mut VecDeque<Digest>,
        fetch_next_queue: &mut Vec<Digest>,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let mut in_local_cache = self.contains_object(digest).await;
        if in_local_cache {
            // Skip download, already in local cache.
        } else if digest.size_bytes >= remote.max_batch_total_size_bytes()
            || !remote.batch_read_supported()
        {
            // Too large for a batch request; download in an independent request.
            self.ensure_blob(remote, digest).await?;
            in_local_cache = true;
        } else if !batch.add(remote.max_batch_total_size_bytes(), digest) {
            // Not enough space left in the batch request; complete the pending batch first.
            self.flush_read_batch(remote, batch, fetch_queue, fetch_next_queue)
                .await?;
            batch.add(remote.max_batch_total_size_bytes(), digest);
        }

        if recursive {
            if in_local_cache {
                fetch_queue.push_back(digest);
            } else {
                // The directory will be walkable after the pending batch completes.
                fetch_next_queue.push(digest);
            }
        }
        Ok(())
    }

    ///
    /// Fetches a remote directory tree into the store with look-ahead batching: while one
    /// directory is walked, the blobs of its children ride in an accumulating batch, and
    /// directories whose bytes are still in flight are deferred until the batch is flushed.
    /// A directory is only ever decoded after its blob is locally present.
    ///
    async fn fetch_directory(
        &self,
        remote: &dyn CasRemote,
        dir_digest: Digest,
        excluded_subdirs: &[String],
    ) -> Result<(), RemoteError> {
        let mut fetch_queue = VecDeque::from([dir_digest]);
        let mut fetch_next_queue: Vec<Digest> = vec![];
        let mut batch = ReadBatch::default();
        let mut at_root = true;

        while !fetch_queue.is_empty() || !fetch_next_queue.is_empty() {
            if fetch_queue.is_empty() {
                self.flush_read_batch(remote, &mut batch, &mut fetch_queue, &mut fetch_next_queue)
                    .await?;
            }

            let dir_digest = fetch_queue
                .pop_front()
                .expect("refilled from the deferred queue above");

            let objpath = self.ensure_blob(remote, dir_digest).await?;
            let bytes = tokio::fs::read(&objpath).await.map_err(|e| {
                RemoteError::Other(format!("Failed to read fetched directory {objpath:?}: {e}"))
            })?;
            let directory = remexec::Directory::decode(bytes.as_slice()).map_err(|e| {
                RemoteError::Other(format!(
                    "Fetched object {} is not a valid Directory: {e}",
                    dir_digest.hash
                ))
            })?;
            verify_directory_canonical(dir_digest, &directory).map_err(RemoteError::Other)?;

            for dirnode in &directory.directories {
                if at_root && excluded_subdirs.contains(&dirnode.name) {
                    // Deliberately left dangling; checkout skips it, a later pull completes it.
                    continue;
                }
                let digest = require_digest(dirnode.digest.as_ref()).map_err(RemoteError::Other)?;
                self.fetch_directory_node(
                    remote,
                    digest,
                    &mut batch,
                    &mut fetch_queue,
                    &mut fetch_next_queue,
                    true,
                )
                .await?;
            }

            for filenode in &directory.files {
                let digest =
                    require_digest(filenode.digest.as_ref()).map_err(RemoteError::Other)?;
                self.fetch_directory_node(
                    remote,
                    digest,
                    &mut batch,
                    &mut fetch_queue,
                    &mut fetch_next_queue,
                    false,
                )
                .await?;
            }

            at_root = false;
        }

        // Fetch the final batch.
        self.flush_read_batch(remote, &mut batch, &mut fetch_queue, &mut fetch_next_queue)
            .await
    }

    ///
    /// Fetches an REv2 `Tree` blob and ingests its contents. The `Tree` blob itself is only
    /// ever staged in the scratch directory; what lands in the store are the file blobs and
    /// the individual Directory messages.
    ///
    /// The `Tree.children` field carries no ordering contract, so a dependency order is
    /// computed here rather than assumed: a Directory is only stored once every subdirectory
    /// it references is already stored or already local, keeping dangling references
    /// unobservable no matter how the server arranged the message. A Tree that references a
    /// directory it neither carries nor finds locally present is rejected.
    ///
    async fn fetch_tree(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
    ) -> Result<Digest, RemoteError> {
        let tmp = self.stage_download_file()?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to open {tmp:?}: {e}")))?;
        remote.read_blob(digest, &mut file).await?;
        file.shutdown()
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to flush {tmp:?}: {e}")))?;
        drop(file);

        let bytes = tokio::fs::read(&tmp)
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to read fetched tree: {e}")))?;
        let tree = remexec::Tree::decode(bytes.as_slice())
            .map_err(|e| RemoteError::Other(format!("Fetched object is not a valid Tree: {e}")))?;
        let root = tree
            .root
            .ok_or_else(|| RemoteError::Other("Tree message had no root directory".to_owned()))?;
        let root_digest = Digest::of_bytes(&root.encode_to_vec());

        for directory in tree.children.iter().chain(std::iter::once(&root)) {
            for filenode in &directory.files {
                let file_digest =
                    require_digest(filenode.digest.as_ref()).map_err(RemoteError::Other)?;
                self.ensure_blob(remote, file_digest).await?;
            }
        }

        let mut pending: VecDeque<remexec::Directory> = tree.children.into();
        pending.push_back(root);
        let mut stored: HashSet<Fingerprint> = HashSet::new();
        let mut stalled = 0;
        while let Some(directory) = pending.pop_front() {
            let mut ready = true;
            for dirnode in &directory.directories {
                let child = require_digest(dirnode.digest.as_ref()).map_err(RemoteError::Other)?;
                if !stored.contains(&child.hash) && !self.contains_object(child).await {
                    ready = false;
                    break;
                }
            }
            if !ready {
                // Some referent has not been stored yet; revisit once the rest of the
                // message has been drained.
                if stalled > pending.len() {
                    return Err(RemoteError::Other(
                        "Tree message references directories it does not carry".to_owned(),
                    ));
                }
                stalled += 1;
                pending.push_back(directory);
                continue;
            }

            let bytes = directory.encode_to_vec();
            let dir_digest = Digest::of_bytes(&bytes);
            verify_directory_canonical(dir_digest, &directory).map_err(RemoteError::Other)?;
            self.objects
                .add_buffer(&bytes)
                .await
                .map_err(RemoteError::Other)?;
            stored.insert(dir_digest.hash);
            stalled = 0;
        }

        Ok(root_digest)
    }

    ///
    /// Enumerates every blob of the tree rooted at `directory_digest`: the directory itself,
    /// its files, then each subdirectory recursively. The sequence may contain duplicates;
    /// consumers deduplicate.
    ///
    fn required_blobs<'a>(
        &'a self,
        directory_digest: Digest,
        out: &'a mut Vec<Digest>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            out.push(directory_digest);
            let directory = self.load_directory(directory_digest).await?.ok_or_else(|| {
                StoreError::Storage(format!(
                    "Missing directory object {}",
                    directory_digest.hash
                ))
            })?;
            for filenode in &directory.files {
                out.push(require_digest(filenode.digest.as_ref())?);
            }
            for dirnode in &directory.directories {
                let child = require_digest(dirnode.digest.as_ref())?;
                self.required_blobs(child, &mut *out).await?;
            }
            Ok(())
        }
        .boxed()
    }

    ///
    /// Uploads every blob of the given tree the server reports missing. Missing-blob discovery
    /// runs in bounded FindMissingBlobs groups; uploads are batched, with oversized blobs (and
    /// servers without the batch RPC) falling back to one streamed request per blob.
    ///
    async fn send_directory(
        &self,
        remote: &dyn CasRemote,
        digest: Digest,
    ) -> Result<(), RemoteError> {
        // A fresh upload id per call.
        let u_uid = Uuid::new_v4();

        let mut required_blobs = vec![];
        self.required_blobs(digest, &mut required_blobs)
            .await
            .map_err(|e| RemoteError::Other(e.to_string()))?;

        let mut missing_blobs: HashMap<Fingerprint, Digest> = HashMap::new();
        for group in required_blobs.chunks(FIND_MISSING_GROUP_SIZE) {
            let response = remote.find_missing_blobs(group.to_vec()).await?;
            for missing in response {
                missing_blobs.insert(missing.hash, missing);
            }
        }

        self.send_blobs(remote, missing_blobs.into_values().collect(), u_uid)
            .await
    }

    async fn send_blobs(
        &self,
        remote: &dyn CasRemote,
        digests: Vec<Digest>,
        u_uid: Uuid,
    ) -> Result<(), RemoteError> {
        let mut batch = UpdateBatch::default();
        for digest in digests {
            let objpath = self.object_path(digest);
            if digest.size_bytes >= remote.max_batch_total_size_bytes()
                || !remote.batch_update_supported()
            {
                // Too large for a batch request; upload in an independent request.
                let file = tokio::fs::File::open(&objpath).await.map_err(|e| {
                    RemoteError::Other(format!("Failed to open {objpath:?} for upload: {e}"))
                })?;
                remote.write_blob(digest, u_uid, file).await?;
            } else {
                let bytes = tokio::fs::read(&objpath).await.map_err(|e| {
                    RemoteError::Other(format!("Failed to read {objpath:?} for upload: {e}"))
                })?;
                if bytes.len() != digest.size_bytes {
                    return Err(RemoteError::Other(format!(
                        "Object {objpath:?} changed size: expected {} bytes, found {}",
                        digest.size_bytes,
                        bytes.len()
                    )));
                }
                let bytes = Bytes::from(bytes);
                if !batch.add(remote.max_batch_total_size_bytes(), digest, bytes.clone()) {
                    // Not enough space left in the batch request; complete the pending batch
                    // first.
                    remote.batch_update_blobs(batch.take()).await?;
                    batch.add(remote.max_batch_total_size_bytes(), digest, bytes);
                }
            }
        }

        // Send the final batch.
        let final_batch = batch.take();
        if !final_batch.is_empty() {
            remote.batch_update_blobs(final_batch).await?;
        }
        Ok(())
    }
}

fn push_error(refs: &[&str], status: &Status) -> StoreError {
    StoreError::Push {
        message: format!("Failed to push ref {refs:?}: {}", status_to_str(status)),
        temporary: true,
    }
}
