// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use cas::{CasRemote, LoadDestination};
use hashing::{Digest, Fingerprint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tonic::Status;
use uuid::Uuid;

use crate::data::TestDirectory;

///
/// An in-memory implementation of the remote CAS surface, answering requests with either known
/// content or NOT_FOUND, and counting the requests and blob transfers it serves so that tests
/// can assert on traffic, not just on outcomes.
///
pub struct StubCas {
    blobs: Mutex<HashMap<Fingerprint, Bytes>>,
    refs: Mutex<HashMap<String, Digest>>,
    batch_read_supported: bool,
    batch_update_supported: bool,
    max_batch_total_size_bytes: usize,
    always_errors: bool,
    resource_exhausted: bool,
    read_request_count: AtomicUsize,
    write_request_count: AtomicUsize,
    batch_read_request_count: AtomicUsize,
    batch_update_request_count: AtomicUsize,
    find_missing_request_count: AtomicUsize,
    blobs_uploaded: AtomicUsize,
    blobs_downloaded: AtomicUsize,
}

pub struct StubCasBuilder {
    batch_read_supported: bool,
    batch_update_supported: bool,
    max_batch_total_size_bytes: usize,
    always_errors: bool,
    resource_exhausted: bool,
}

impl StubCasBuilder {
    pub fn batch_read_supported(mut self, supported: bool) -> StubCasBuilder {
        self.batch_read_supported = supported;
        self
    }

    pub fn batch_update_supported(mut self, supported: bool) -> StubCasBuilder {
        self.batch_update_supported = supported;
        self
    }

    pub fn max_batch_total_size_bytes(mut self, limit: usize) -> StubCasBuilder {
        self.max_batch_total_size_bytes = limit;
        self
    }

    /// Every RPC fails with an internal error.
    pub fn always_errors(mut self) -> StubCasBuilder {
        self.always_errors = true;
        self
    }

    /// Every mutating RPC fails with RESOURCE_EXHAUSTED, as a throttling server would.
    pub fn resource_exhausted(mut self) -> StubCasBuilder {
        self.resource_exhausted = true;
        self
    }

    pub fn build(self) -> StubCas {
        StubCas {
            blobs: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
            batch_read_supported: self.batch_read_supported,
            batch_update_supported: self.batch_update_supported,
            max_batch_total_size_bytes: self.max_batch_total_size_bytes,
            always_errors: self.always_errors,
            resource_exhausted: self.resource_exhausted,
            read_request_count: AtomicUsize::new(0),
            write_request_count: AtomicUsize::new(0),
            batch_read_request_count: AtomicUsize::new(0),
            batch_update_request_count: AtomicUsize::new(0),
            find_missing_request_count: AtomicUsize::new(0),
            blobs_uploaded: AtomicUsize::new(0),
            blobs_downloaded: AtomicUsize::new(0),
        }
    }
}

impl StubCas {
    pub fn builder() -> StubCasBuilder {
        StubCasBuilder {
            batch_read_supported: true,
            batch_update_supported: true,
            max_batch_total_size_bytes: 4 * 1024 * 1024,
            always_errors: false,
            resource_exhausted: false,
        }
    }

    pub fn empty() -> StubCas {
        StubCas::builder().build()
    }

    pub fn insert_blob(&self, bytes: &[u8]) -> Digest {
        let digest = Digest::of_bytes(bytes);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.hash, Bytes::copy_from_slice(bytes));
        digest
    }

    /// Stores the serialized form of the given directory, returning its digest.
    pub fn insert_directory(&self, directory: &TestDirectory) -> Digest {
        self.insert_blob(&directory.bytes())
    }

    pub fn insert_ref(&self, name: &str, digest: Digest) {
        self.refs.lock().unwrap().insert(name.to_owned(), digest);
    }

    pub fn remove_blob(&self, digest: Digest) {
        self.blobs.lock().unwrap().remove(&digest.hash);
    }

    pub fn contains_blob(&self, digest: Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(&digest.hash)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn get_ref(&self, name: &str) -> Option<Digest> {
        self.refs.lock().unwrap().get(name).copied()
    }

    pub fn read_request_count(&self) -> usize {
        self.read_request_count.load(Ordering::SeqCst)
    }

    pub fn write_request_count(&self) -> usize {
        self.write_request_count.load(Ordering::SeqCst)
    }

    pub fn batch_read_request_count(&self) -> usize {
        self.batch_read_request_count.load(Ordering::SeqCst)
    }

    pub fn batch_update_request_count(&self) -> usize {
        self.batch_update_request_count.load(Ordering::SeqCst)
    }

    pub fn find_missing_request_count(&self) -> usize {
        self.find_missing_request_count.load(Ordering::SeqCst)
    }

    /// Blobs received over any upload RPC.
    pub fn blobs_uploaded(&self) -> usize {
        self.blobs_uploaded.load(Ordering::SeqCst)
    }

    /// Blobs served over any download RPC.
    pub fn blobs_downloaded(&self) -> usize {
        self.blobs_downloaded.load(Ordering::SeqCst)
    }

    fn check_availability(&self) -> Result<(), Status> {
        if self.always_errors {
            return Err(Status::internal("StubCas is configured to always fail"));
        }
        Ok(())
    }

    fn check_quota(&self) -> Result<(), Status> {
        if self.resource_exhausted {
            return Err(Status::resource_exhausted(
                "StubCas is configured to throttle writes",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CasRemote for StubCas {
    fn max_batch_total_size_bytes(&self) -> usize {
        self.max_batch_total_size_bytes
    }

    fn batch_read_supported(&self) -> bool {
        self.batch_read_supported
    }

    fn batch_update_supported(&self) -> bool {
        self.batch_update_supported
    }

    async fn get_reference(&self, key: &str) -> Result<Digest, Status> {
        self.check_availability()?;
        self.refs
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .ok_or_else(|| Status::not_found(format!("Unknown ref {key}")))
    }

    async fn update_reference(&self, keys: &[&str], digest: Digest) -> Result<(), Status> {
        self.check_availability()?;
        self.check_quota()?;
        let mut refs = self.refs.lock().unwrap();
        for key in keys {
            refs.insert((*key).to_owned(), digest);
        }
        Ok(())
    }

    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>, Status> {
        self.check_availability()?;
        self.find_missing_request_count.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .into_iter()
            .filter(|digest| !blobs.contains_key(&digest.hash))
            .collect())
    }

    async fn batch_update_blobs(&self, blobs: Vec<(Digest, Bytes)>) -> Result<(), Status> {
        self.check_availability()?;
        self.check_quota()?;
        self.batch_update_request_count
            .fetch_add(1, Ordering::SeqCst);
        if !self.batch_update_supported {
            return Err(Status::unimplemented("BatchUpdateBlobs is not supported"));
        }
        let mut stored = self.blobs.lock().unwrap();
        for (digest, bytes) in blobs {
            if Digest::of_bytes(&bytes) != digest {
                return Err(Status::invalid_argument(format!(
                    "Batched blob did not match its digest {digest:?}"
                )));
            }
            stored.insert(digest.hash, bytes);
            self.blobs_uploaded.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn batch_read_blobs(&self, digests: Vec<Digest>) -> Result<Vec<(Digest, Bytes)>, Status> {
        self.check_availability()?;
        self.batch_read_request_count.fetch_add(1, Ordering::SeqCst);
        if !self.batch_read_supported {
            return Err(Status::unimplemented("BatchReadBlobs is not supported"));
        }
        let blobs = self.blobs.lock().unwrap();
        let mut out = Vec::with_capacity(digests.len());
        for digest in digests {
            let bytes = blobs
                .get(&digest.hash)
                .ok_or_else(|| Status::not_found(format!("Unknown blob {:?}", digest.hash)))?;
            out.push((digest, bytes.clone()));
            self.blobs_downloaded.fetch_add(1, Ordering::SeqCst);
        }
        Ok(out)
    }

    async fn read_blob(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<(), Status> {
        self.check_availability()?;
        self.read_request_count.fetch_add(1, Ordering::SeqCst);
        let bytes = {
            let blobs = self.blobs.lock().unwrap();
            blobs
                .get(&digest.hash)
                .ok_or_else(|| Status::not_found(format!("Unknown blob {:?}", digest.hash)))?
                .clone()
        };
        destination
            .reset()
            .await
            .map_err(|e| Status::internal(format!("Failed to reset destination: {e}")))?;
        destination
            .write_all(&bytes)
            .await
            .map_err(|e| Status::internal(format!("Failed to write blob: {e}")))?;
        destination
            .flush()
            .await
            .map_err(|e| Status::internal(format!("Failed to flush blob: {e}")))?;
        self.blobs_downloaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_blob(
        &self,
        digest: Digest,
        _u_uid: Uuid,
        mut file: tokio::fs::File,
    ) -> Result<(), Status> {
        self.check_availability()?;
        self.check_quota()?;
        self.write_request_count.fetch_add(1, Ordering::SeqCst);
        let mut bytes = Vec::with_capacity(digest.size_bytes);
        file.read_to_end(&mut bytes)
            .await
            .map_err(|e| Status::internal(format!("Failed to read upload: {e}")))?;
        if Digest::of_bytes(&bytes) != digest {
            return Err(Status::invalid_argument(format!(
                "Streamed blob did not match its digest {digest:?}"
            )));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.hash, Bytes::from(bytes));
        self.blobs_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
