// SPDX-License-Identifier: MIT OR Apache-2.0

use strata_core::{FieldKind, SchemaService};

use crate::graph::GraphError;

const IMPLICIT_PREFIX: &str = "__implicit:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// To-one relationship (`belongsTo`).
    Resource,

    /// To-many relationship (`hasMany`).
    Collection,

    /// Inverse side of a relationship the schema doesn't model.
    Implicit,
}

impl EdgeKind {
    fn from_field(kind: FieldKind) -> Option<Self> {
        match kind {
            FieldKind::Attribute => None,
            FieldKind::BelongsTo => Some(EdgeKind::Resource),
            FieldKind::HasMany => Some(EdgeKind::Collection),
        }
    }
}

/// Everything the graph needs to know about one relationship field of one resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeDefinition {
    pub owner_type: String,
    pub field: String,
    pub kind: EdgeKind,
    pub related_type: String,
    pub is_async: bool,
    pub polymorphic: bool,

    /// Field on the related resource pointing back. For relationships without a declared inverse
    /// this is the name of an implicit edge.
    pub inverse_field: String,
    pub inverse_kind: EdgeKind,
}

impl EdgeDefinition {
    /// Looks up the definition of a relationship field.
    ///
    /// Returns `None` for attributes and unknown fields.
    pub(crate) fn resolve(
        schema: &dyn SchemaService,
        resource_type: &str,
        field: &str,
    ) -> Result<Option<Self>, GraphError> {
        if let Some((owner_type, owner_field)) = parse_implicit_field(field) {
            return Ok(Self::resolve_implicit(schema, resource_type, owner_type, owner_field));
        }

        let Some(schema_field) = schema.field(resource_type, field) else {
            return Ok(None);
        };
        let Some(kind) = EdgeKind::from_field(schema_field.kind) else {
            return Ok(None);
        };
        let related_type = schema_field.related_type.clone().unwrap_or_default();

        let (inverse_field, inverse_kind) = match &schema_field.options.inverse {
            Some(inverse) => {
                let inverse_kind = schema
                    .field(&related_type, inverse)
                    .and_then(|inverse_field| EdgeKind::from_field(inverse_field.kind))
                    .ok_or_else(|| GraphError::MissingInverse {
                        resource_type: resource_type.to_owned(),
                        field: field.to_owned(),
                        related_type: related_type.clone(),
                        inverse: inverse.clone(),
                    })?;
                (inverse.clone(), inverse_kind)
            }
            None => (implicit_field(resource_type, field), EdgeKind::Implicit),
        };

        Ok(Some(Self {
            owner_type: resource_type.to_owned(),
            field: field.to_owned(),
            kind,
            related_type,
            is_async: schema_field.options.is_async,
            polymorphic: schema_field.options.polymorphic,
            inverse_field,
            inverse_kind,
        }))
    }

    fn resolve_implicit(
        schema: &dyn SchemaService,
        resource_type: &str,
        owner_type: &str,
        owner_field: &str,
    ) -> Option<Self> {
        let forward = schema.field(owner_type, owner_field)?;
        let inverse_kind = EdgeKind::from_field(forward.kind)?;

        Some(Self {
            owner_type: resource_type.to_owned(),
            field: implicit_field(owner_type, owner_field),
            kind: EdgeKind::Implicit,
            related_type: owner_type.to_owned(),
            is_async: false,
            polymorphic: true,
            inverse_field: owner_field.to_owned(),
            inverse_kind,
        })
    }

    pub fn is_implicit(&self) -> bool {
        self.kind == EdgeKind::Implicit
    }

    /// Returns `true` if resources of the given type may be members of this edge.
    pub fn accepts(&self, resource_type: &str) -> bool {
        self.polymorphic || self.related_type == resource_type
    }
}

/// Name of the implicit edge tracking the inverse of `owner_type.field`.
pub fn implicit_field(owner_type: &str, field: &str) -> String {
    format!("{IMPLICIT_PREFIX}{owner_type}:{field}")
}

fn parse_implicit_field(field: &str) -> Option<(&str, &str)> {
    field.strip_prefix(IMPLICIT_PREFIX)?.split_once(':')
}
