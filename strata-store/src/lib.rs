// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(doctest, doc=include_str!("../README.md"))]

//! Client-side cache for server-described resources.
//!
//! Three parts work on one shared identifier space:
//!
//! - The `IdentifierCache` hands out exactly one `ResourceKey` per resource and merges keys which
//!   turn out to name the same resource.
//! - The `RelationshipGraph` keeps remote (server-confirmed) and local (client-mutated) state of
//!   every relationship and keeps both sides of a relationship in sync.
//! - The `RequestCoordinator` answers requests from cached documents or through a `Handler`,
//!   deduplicates requests which are in flight and commits fetched documents into the caches.
//!
//! ## Batches
//!
//! Mutations and commits run inside batches (`Store::join`). Remote writes to the same
//! relationship within a batch are flushed into local state once, and subscribers get at most one
//! notification per resource, bucket and field when the outermost batch ends.
//!
//! ## Runtime
//!
//! Everything runs on a single thread. State is shared through `Rc` handles and fetches are
//! spawned with `tokio::task::spawn_local`, requests therefore need to be made from within a
//! `tokio::task::LocalSet`.
mod builder;
pub mod cache;
pub mod documents;
pub mod graph;
pub mod identifiers;
pub mod notifications;
pub mod requests;
pub mod resources;
mod store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use builder::StoreBuilder;
pub use cache::{Cache, CommitError};
pub use documents::{Content, Document, DocumentCache, DocumentEntry};
pub use graph::{GraphError, Operation, PolymorphicTypeError, RelationshipGraph};
pub use identifiers::{IdentifierCache, IdentifierConfig, IdentityError};
pub use notifications::{Bucket, Notification, NotificationManager, NotificationTarget};
pub use requests::{
    CachePolicy, DefaultCachePolicy, FnHandler, Handler, PolicyConfig, RequestCoordinator,
    RequestError,
};
pub use resources::ResourceCache;
pub use store::Store;
