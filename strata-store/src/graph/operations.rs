// SPDX-License-Identifier: MIT OR Apache-2.0

use serde_json::Value;
use strata_core::ResourceKey;

/// Members of a relationship, either to-one or to-many.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationshipValue {
    One(Option<ResourceKey>),
    Many(Vec<ResourceKey>),
}

impl RelationshipValue {
    pub fn keys(&self) -> &[ResourceKey] {
        match self {
            RelationshipValue::One(Some(key)) => std::slice::from_ref(key),
            RelationshipValue::One(None) => &[],
            RelationshipValue::Many(keys) => keys,
        }
    }
}

/// Relationship data received from the server, with identifiers already resolved.
///
/// `data` is `None` when only `links` or `meta` were sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelationshipUpdate {
    pub data: Option<RelationshipValue>,
    pub links: Option<Value>,
    pub meta: Option<Value>,
}

impl RelationshipUpdate {
    pub fn one(key: Option<ResourceKey>) -> Self {
        Self {
            data: Some(RelationshipValue::One(key)),
            ..Default::default()
        }
    }

    pub fn many(keys: Vec<ResourceKey>) -> Self {
        Self {
            data: Some(RelationshipValue::Many(keys)),
            ..Default::default()
        }
    }
}

/// Local relationship state as exposed to consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipState {
    pub data: RelationshipValue,
    pub links: Option<Value>,
    pub meta: Option<Value>,
}

/// Mutation of the relationship graph.
///
/// All operations except `UpdateRelationship` change the local side of an edge.
/// `UpdateRelationship` writes remote state and schedules a flush of the local side.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    AddToHasMany {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,

        /// Position to insert at, appends when `None`.
        index: Option<usize>,
    },
    RemoveFromHasMany {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
    },
    ReplaceRelatedRecord {
        record: ResourceKey,
        field: String,
        value: Option<ResourceKey>,
    },
    ReplaceRelatedRecords {
        record: ResourceKey,
        field: String,
        value: Vec<ResourceKey>,
    },
    UpdateRelationship {
        record: ResourceKey,
        field: String,
        payload: RelationshipUpdate,
    },

    /// Removes a deleted record from the local state of all its relationships. New records are
    /// unloaded right away.
    DeleteRecord { record: ResourceKey, is_new: bool },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddToHasMany { .. } => "addToHasMany",
            Operation::RemoveFromHasMany { .. } => "removeFromHasMany",
            Operation::ReplaceRelatedRecord { .. } => "replaceRelatedRecord",
            Operation::ReplaceRelatedRecords { .. } => "replaceRelatedRecords",
            Operation::UpdateRelationship { .. } => "updateRelationship",
            Operation::DeleteRecord { .. } => "deleteRecord",
        }
    }

    pub fn record(&self) -> &ResourceKey {
        match self {
            Operation::AddToHasMany { record, .. }
            | Operation::RemoveFromHasMany { record, .. }
            | Operation::ReplaceRelatedRecord { record, .. }
            | Operation::ReplaceRelatedRecords { record, .. }
            | Operation::UpdateRelationship { record, .. }
            | Operation::DeleteRecord { record, .. } => record,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Operation::AddToHasMany { field, .. }
            | Operation::RemoveFromHasMany { field, .. }
            | Operation::ReplaceRelatedRecord { field, .. }
            | Operation::ReplaceRelatedRecords { field, .. }
            | Operation::UpdateRelationship { field, .. } => Some(field),
            Operation::DeleteRecord { .. } => None,
        }
    }

    /// Every resource this operation would add to or remove from an edge.
    pub fn values(&self) -> &[ResourceKey] {
        match self {
            Operation::AddToHasMany { value, .. }
            | Operation::RemoveFromHasMany { value, .. }
            | Operation::ReplaceRelatedRecords { value, .. } => value,
            Operation::ReplaceRelatedRecord { value, .. } => match value {
                Some(key) => std::slice::from_ref(key),
                None => &[],
            },
            Operation::UpdateRelationship { payload, .. } => match &payload.data {
                Some(data) => data.keys(),
                None => &[],
            },
            Operation::DeleteRecord { .. } => &[],
        }
    }
}
