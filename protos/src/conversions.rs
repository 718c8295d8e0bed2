// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::remexec;

impl From<&hashing::Digest> for remexec::Digest {
    fn from(d: &hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl From<hashing::Digest> for remexec::Digest {
    fn from(d: hashing::Digest) -> Self {
        (&d).into()
    }
}

impl TryFrom<&remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: &remexec::Digest) -> Result<Self, Self::Error> {
        hashing::Fingerprint::from_hex_string(&d.hash)
            .map_err(|err| format!("Bad fingerprint in Digest {:?}: {:?}", d.hash, err))
            .map(|fingerprint| hashing::Digest::new(fingerprint, d.size_bytes as usize))
    }
}

impl TryFrom<remexec::Digest> for hashing::Digest {
    type Error = String;

    fn try_from(d: remexec::Digest) -> Result<Self, Self::Error> {
        (&d).try_into()
    }
}
