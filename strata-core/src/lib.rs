// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data types shared by all layers of the strata resource store: resource identifiers, the
//! normalized document shape, request descriptions and the schema interface.
pub mod document;
pub mod identifier;
pub mod request;
pub mod schema;
mod serde;

pub use document::{ApiError, Linkage, PrimaryData, RelationshipPayload, Resource, StructuredDocument};
pub use identifier::{ResourceIdentifier, ResourceKey};
pub use request::{
    CacheOptions, FetchError, Method, RequestInfo, RequestKey, RequestOp, Response, ResponseMeta,
};
pub use schema::{FieldKind, FieldSchema, Fields, MemorySchema, RelationshipOptions, SchemaService};
