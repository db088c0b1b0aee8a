// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request deduplication, staleness policies and committing of fetched documents.
//!
//! Reads are answered from the document cache when the `CachePolicy` allows it, everything else
//! goes through the `Handler` chain. Requests with the same `RequestKey` share one fetch while it
//! is in flight.
mod coordinator;
mod handler;
mod policy;

use strata_core::FetchError;
use thiserror::Error;

use crate::cache::CommitError;

pub use coordinator::{Priority, RequestCoordinator};
pub use handler::{FnHandler, Handler};
pub use policy::{CachePolicy, DefaultCachePolicy, PolicyConfig};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Server rejected a save. Errors are attached to the saved resources as well.
    #[error("mutation rejected: {0}")]
    MutationRejected(FetchError),

    #[error("request was aborted")]
    Aborted,

    #[error("can't serialize request body: {0}")]
    Serialize(String),

    #[error(transparent)]
    Commit(#[from] CommitError),
}
