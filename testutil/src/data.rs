// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use bytes::Bytes;
use hashing::Digest;
use prost::Message;
use protos::remexec;

/// A blob of known content for tests to store, fetch and compare against.
#[derive(Clone, Debug)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn hello() -> TestData {
        TestData::new("hello\n")
    }

    pub fn script() -> TestData {
        TestData::new("#!/bin/sh\necho hi\n")
    }

    pub fn all_the_henries() -> TestData {
        // A blob noticeably larger than one hashing chunk.
        TestData::new(&"O for a muse of fire, that would ascend the brightest heaven of invention\n".repeat(100))
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.string.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

/// Builds canonical `Directory` messages (entries sorted by name) with known digests, for
/// seeding stub remotes and for asserting on commit results.
#[derive(Clone, Debug, Default)]
pub struct TestDirectory {
    directory: remexec::Directory,
}

impl TestDirectory {
    pub fn new() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory::default(),
        }
    }

    pub fn with_file(mut self, name: &str, data: &TestData, is_executable: bool) -> TestDirectory {
        self.directory.files.push(remexec::FileNode {
            name: name.to_owned(),
            digest: Some(data.digest().into()),
            is_executable,
        });
        self
    }

    pub fn with_dir(mut self, name: &str, child: &TestDirectory) -> TestDirectory {
        self.directory.directories.push(remexec::DirectoryNode {
            name: name.to_owned(),
            digest: Some(child.digest().into()),
        });
        self
    }

    pub fn with_symlink(mut self, name: &str, target: &str) -> TestDirectory {
        self.directory.symlinks.push(remexec::SymlinkNode {
            name: name.to_owned(),
            target: target.to_owned(),
        });
        self
    }

    /// The message with all three sequences in canonical (sorted) order.
    pub fn directory(&self) -> remexec::Directory {
        let mut directory = self.directory.clone();
        directory.files.sort_by(|a, b| a.name.cmp(&b.name));
        directory.directories.sort_by(|a, b| a.name.cmp(&b.name));
        directory.symlinks.sort_by(|a, b| a.name.cmp(&b.name));
        directory
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.directory().encode_to_vec())
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.bytes())
    }
}
