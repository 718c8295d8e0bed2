// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The subset of the Remote Execution API v2 messages that the CAS persists and exchanges.
//!
//! These are maintained by hand rather than generated, but field numbers match
//! `build.bazel.remote.execution.v2` exactly, so the encoded bytes are interchangeable with any
//! other REv2 implementation. Fields this cache has no use for (node properties, compressors) are
//! omitted; proto3 decoding ignores them and encoding simply never emits them.

/// A content digest: the lowercase hex SHA-256 of a blob and its size in bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Digest {
    #[prost(string, tag = "1")]
    pub hash: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

/// A single regular file within a `Directory`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
    // NB: Field 3 was `FileNode.is_executable` in REv1 and is reserved in REv2.
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

/// A single subdirectory within a `Directory`, referenced by the digest of its own serialized
/// `Directory` message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectoryNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub digest: ::core::option::Option<Digest>,
}

/// A single symbolic link within a `Directory`. The target is stored verbatim.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SymlinkNode {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub target: ::prost::alloc::string::String,
}

/// One level of a filesystem tree: files, subdirectories and symlinks, each sorted by name.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Directory {
    #[prost(message, repeated, tag = "1")]
    pub files: ::prost::alloc::vec::Vec<FileNode>,
    #[prost(message, repeated, tag = "2")]
    pub directories: ::prost::alloc::vec::Vec<DirectoryNode>,
    #[prost(message, repeated, tag = "3")]
    pub symlinks: ::prost::alloc::vec::Vec<SymlinkNode>,
}

/// A root `Directory` together with all of the directories it transitively references, flattened
/// into one message so that a whole tree can be fetched with a single blob read.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tree {
    #[prost(message, optional, tag = "1")]
    pub root: ::core::option::Option<Directory>,
    #[prost(message, repeated, tag = "2")]
    pub children: ::prost::alloc::vec::Vec<Directory>,
}
