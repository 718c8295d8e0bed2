// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::remexec;

use hashing::Digest;

///
/// Verifies that the given Directory is in canonical form: within each of the three entry
/// sequences, names are unique, contain exactly one path segment, and are sorted; file and
/// directory entries carry a well-formed digest.
///
/// A name may appear in more than one sequence; the entries denote distinct kinds and are
/// addressed separately by consumers, so that is not a canonicality violation.
///
pub fn verify_directory_canonical(
    digest: Digest,
    directory: &remexec::Directory,
) -> Result<(), String> {
    verify_nodes(&directory.files, true, |n| &n.name, |n| n.digest.as_ref())
        .map_err(|e| format!("Invalid file in {digest:?}: {e}"))?;
    verify_nodes(&directory.directories, true, |n| &n.name, |n| {
        n.digest.as_ref()
    })
    .map_err(|e| format!("Invalid directory in {digest:?}: {e}"))?;
    verify_nodes(&directory.symlinks, false, |n| &n.name, |_| None)
        .map_err(|e| format!("Invalid symlink in {digest:?}: {e}"))?;
    Ok(())
}

fn verify_nodes<Node, GetName, GetDigest>(
    nodes: &[Node],
    digest_required: bool,
    get_name: GetName,
    get_digest: GetDigest,
) -> Result<(), String>
where
    GetName: Fn(&Node) -> &str,
    GetDigest: Fn(&Node) -> Option<&remexec::Digest>,
{
    let mut prev_name: Option<&str> = None;
    for node in nodes {
        let name = get_name(node);
        if name.is_empty() {
            return Err("A child name must not be empty, but an entry had an empty name".to_owned());
        } else if name.contains('/') {
            return Err(format!(
                "All children must have one path segment, but found {name}"
            ));
        }
        if let Some(p) = prev_name {
            if name <= p {
                return Err(format!(
                    "Children must be sorted and unique, but {p} was before {name}"
                ));
            }
        }
        match get_digest(node) {
            Some(digest) => {
                if digest.size_bytes < 0 {
                    return Err(format!(
                        "Entry {name} had a negative size: {}",
                        digest.size_bytes
                    ));
                }
                let _: hashing::Digest = digest
                    .try_into()
                    .map_err(|e| format!("Entry {name} had a malformed digest: {e}"))?;
            }
            None if digest_required => {
                return Err(format!("Entry {name} was missing its digest"));
            }
            None => {}
        }
        prev_name = Some(name);
    }
    Ok(())
}
