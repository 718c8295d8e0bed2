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

pub mod remexec;

mod conversions;
pub mod verification;

pub use crate::verification::verify_directory_canonical;

/// Extracts the digest of a message field that the schema makes optional but the data model
/// requires.
pub fn require_digest(digest_opt: Option<&remexec::Digest>) -> Result<hashing::Digest, String> {
    match digest_opt {
        Some(digest) => digest.try_into(),
        None => Err("Protocol violation: Directory entry was missing its digest".to_owned()),
    }
}
