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

//! Content addressing for the artifact cache.
//!
//! Everything the cache stores - file blobs and serialized Directory messages alike - is named
//! by the SHA-256 of its bytes. This crate owns that naming: the [`Fingerprint`] a blob is
//! filed under, the [`Digest`] that travels through Directory messages and the remote
//! protocol, and the incremental [`Hasher`] the ingestion paths feed while they stream bytes
//! to disk.

use std::fmt;

use hex::FromHex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

///
/// The name of a blob: the raw SHA-256 of its content.
///
/// Spelled as 64 lowercase hex characters everywhere one is written out - in object paths
/// (two characters of shard directory, sixty-two of file name), in Directory entries, and in
/// remote digests.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Parses a hex spelling, as read back from object paths and wire digests.
    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE]>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| {
                format!("{hex_string:?} is not a {FINGERPRINT_SIZE}-byte hex fingerprint: {e}")
            })
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// The canonical 64-character lowercase hex spelling.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_string = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&hex_string).map_err(serde::de::Error::custom)
    }
}

///
/// A blob's identity as Directory messages and the remote protocol carry it: its fingerprint
/// plus its size in bytes.
///
/// Equality is decided by the fingerprint; the size is a redundancy check, and is what lets
/// the sync layer batch blobs against a server's size limits without reading any of them.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    /// The digest of an in-memory blob, for content that never needs streaming.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish()
    }
}

/// The digest of the zero-length blob. Well-defined, but a store may legitimately never hold
/// the blob itself; readers treat its absence as empty content.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);
pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

///
/// Incrementally names a blob while its bytes stream through ingestion.
///
/// The store feeds every chunk it writes to its staging file through one of these, so a blob
/// is hashed and persisted in a single pass; `finish` yields the digest the staged file is
/// then linked into place under.
///
pub struct Hasher {
    sha: Sha256,
    byte_count: usize,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            sha: Sha256::default(),
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.sha.update(bytes);
        self.byte_count += bytes.len();
    }

    pub fn finish(self) -> Digest {
        Digest::new(Fingerprint(self.sha.finalize().into()), self.byte_count)
    }
}
