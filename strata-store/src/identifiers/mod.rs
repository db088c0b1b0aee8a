// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable local identities for resources.
//!
//! The identifier cache hands out exactly one `ResourceKey` per resource and keeps two indices in
//! lockstep: `lid -> key` and `(type, id) -> key`. When an update reveals that two keys name the
//! same resource they are merged and the abandoned key is aliased to the survivor.
mod cache;
mod config;
#[cfg(test)]
mod tests;

use thiserror::Error;

pub use cache::{IdentifierCache, Scratch, Updated};
pub use config::{
    ForgetFn, GenerateFn, IdentifierConfig, MergeFn, UpdateFn, default_generate, default_merge,
};

/// Attempted change of an immutable identifier field.
///
/// Keys are referenced by their display representation, errors outlive the cache state they were
/// raised for.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("lid {lid} belongs to {existing} and can't be referenced with id {id}")]
    LidMismatch {
        lid: String,
        existing: String,
        id: String,
    },

    #[error("can't change id of {key} to {id}")]
    IdChange { key: String, id: String },

    #[error("can't change lid of {key} to {lid}")]
    LidChange { key: String, lid: String },

    #[error("can't change type of {key} to {resource_type}, no matching resource is known")]
    TypeChange { key: String, resource_type: String },

    #[error("update of {key} changes type and id at the same time")]
    AmbiguousUpdate { key: String },

    #[error("merge of {target} and {matched} returned unrelated identifier {result}")]
    InvalidMergeResult {
        target: String,
        matched: String,
        result: String,
    },

    #[error("generated lid {lid} is already taken by {existing}")]
    DuplicateLid { lid: String, existing: String },
}
