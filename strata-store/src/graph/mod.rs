// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relationship state between resources.
//!
//! The graph holds one edge per resource and relationship field. Mutations always update both
//! sides of a relationship, including implicit edges for inverses the schema doesn't declare.
//! Remote writes don't touch local state directly, they schedule a flush which runs once when the
//! outermost batch ends.
mod definition;
mod edges;
mod operations;
mod relationship_graph;
#[cfg(test)]
mod tests;

use thiserror::Error;

pub use definition::{EdgeDefinition, EdgeKind, implicit_field};
pub use edges::{CollectionEdge, Edge, EdgeState, ImplicitEdge, ResourceEdge, Side};
pub use operations::{Operation, RelationshipState, RelationshipUpdate, RelationshipValue};
pub use relationship_graph::{GraphBatch, RelationshipGraph};

/// Resource of a type not permitted by a non-polymorphic relationship.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{actual} can't be used in relationship {resource_type}.{field} of type {expected}")]
pub struct PolymorphicTypeError {
    pub resource_type: String,
    pub field: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    PolymorphicType(#[from] PolymorphicTypeError),

    #[error("{resource_type} has no relationship named {field}")]
    UnknownField {
        resource_type: String,
        field: String,
    },

    #[error("inverse {inverse} of {resource_type}.{field} is not a relationship of {related_type}")]
    MissingInverse {
        resource_type: String,
        field: String,
        related_type: String,
        inverse: String,
    },

    #[error("{operation} can't be applied to {kind:?} relationship {resource_type}.{field}")]
    KindMismatch {
        operation: &'static str,
        kind: EdgeKind,
        resource_type: String,
        field: String,
    },
}
