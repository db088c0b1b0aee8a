// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use crate::identifier::ResourceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Attribute,
    BelongsTo,
    HasMany,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationshipOptions {
    /// Related resources are loaded lazily and may not be present locally.
    pub is_async: bool,

    /// Name of the field on the related type pointing back, `None` if the inverse is not modelled.
    pub inverse: Option<String>,

    /// Related resources can be of any type, not only `related_type`.
    pub polymorphic: bool,
}

/// Description of a single field of a resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,

    /// Type of the related resource, `None` for attributes.
    pub related_type: Option<String>,
    pub options: RelationshipOptions,
}

impl FieldSchema {
    pub fn attribute(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Attribute,
            related_type: None,
            options: RelationshipOptions::default(),
        }
    }

    pub fn belongs_to(name: impl Into<String>, related_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::BelongsTo,
            related_type: Some(related_type.into()),
            options: RelationshipOptions::default(),
        }
    }

    pub fn has_many(name: impl Into<String>, related_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::HasMany,
            related_type: Some(related_type.into()),
            options: RelationshipOptions::default(),
        }
    }

    pub fn inverse(mut self, field: impl Into<String>) -> Self {
        self.options.inverse = Some(field.into());
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.options.polymorphic = true;
        self
    }

    pub fn async_relationship(mut self) -> Self {
        self.options.is_async = true;
        self
    }

    pub fn is_relationship(&self) -> bool {
        self.kind != FieldKind::Attribute
    }
}

pub type Fields = BTreeMap<String, FieldSchema>;

/// Source of truth about resource types and their fields.
pub trait SchemaService {
    /// Returns all fields of the given resource type. Unknown types have no fields.
    fn fields_for_type(&self, resource_type: &str) -> Fields;

    fn fields(&self, key: &ResourceKey) -> Fields {
        self.fields_for_type(key.resource_type())
    }

    fn field(&self, resource_type: &str, name: &str) -> Option<FieldSchema> {
        self.fields_for_type(resource_type).remove(name)
    }

    fn has_resource(&self, resource_type: &str) -> bool;
}

/// Schema kept in memory, built up front.
#[derive(Clone, Debug, Default)]
pub struct MemorySchema {
    types: BTreeMap<String, Fields>,
}

impl MemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(
        mut self,
        resource_type: impl Into<String>,
        fields: impl IntoIterator<Item = FieldSchema>,
    ) -> Self {
        self.register(resource_type, fields);
        self
    }

    pub fn register(
        &mut self,
        resource_type: impl Into<String>,
        fields: impl IntoIterator<Item = FieldSchema>,
    ) {
        let entry = self.types.entry(resource_type.into()).or_default();
        for field in fields {
            entry.insert(field.name.clone(), field);
        }
    }
}

impl SchemaService for MemorySchema {
    fn fields_for_type(&self, resource_type: &str) -> Fields {
        self.types.get(resource_type).cloned().unwrap_or_default()
    }

    fn has_resource(&self, resource_type: &str) -> bool {
        self.types.contains_key(resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, FieldSchema, MemorySchema, SchemaService};

    #[test]
    fn lookup_fields() {
        let schema = MemorySchema::new().with_type(
            "user",
            [
                FieldSchema::attribute("name"),
                FieldSchema::belongs_to("bestFriend", "user").inverse("bestFriend"),
                FieldSchema::has_many("pets", "pet").polymorphic(),
            ],
        );

        assert!(schema.has_resource("user"));
        assert!(!schema.has_resource("pet"));

        let best_friend = schema.field("user", "bestFriend").unwrap();
        assert_eq!(best_friend.kind, FieldKind::BelongsTo);
        assert_eq!(best_friend.options.inverse.as_deref(), Some("bestFriend"));
        assert!(schema.field("user", "pets").unwrap().options.polymorphic);
        assert!(!schema.field("user", "name").unwrap().is_relationship());
        assert!(schema.fields_for_type("pet").is_empty());
    }
}
