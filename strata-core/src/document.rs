// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalized document shape exchanged between the store and the handler chain.
//!
//! This mirrors the JSON:API top-level document closely enough to explain commit semantics:
//! primary `data`, side-loaded `included` resources, `links`, `meta` and `errors`.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identifier::ResourceIdentifier;
use crate::serde::deserialize_some;

/// Primary data of a document: either one (possibly absent) resource or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<Resource>),
    One(Option<Resource>),
}

impl PrimaryData {
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        let slice: &[Resource] = match self {
            PrimaryData::Many(resources) => resources.as_slice(),
            PrimaryData::One(Some(resource)) => std::slice::from_ref(resource),
            PrimaryData::One(None) => &[],
        };
        slice.iter()
    }
}

/// Relationship linkage inside a relationship payload.
///
/// `One(None)` represents an explicit `null`, meaning "this relationship is empty".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<ResourceIdentifier>),
    One(Option<ResourceIdentifier>),
}

/// State of a single relationship field as sent by the server.
///
/// `data` is `None` when the payload only carries `links` or `meta`, in which case the known
/// membership must be left alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Linkage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl RelationshipPayload {
    pub fn to_one(identifier: Option<ResourceIdentifier>) -> Self {
        Self {
            data: Some(Linkage::One(identifier)),
            ..Default::default()
        }
    }

    pub fn to_many(identifiers: Vec<ResourceIdentifier>) -> Self {
        Self {
            data: Some(Linkage::Many(identifiers)),
            ..Default::default()
        }
    }
}

/// Full resource object as found in `data` or `included`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipPayload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
            attributes: Map::new(),
            relationships: BTreeMap::new(),
            links: None,
            meta: None,
        }
    }

    pub fn with_lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_relationship(
        mut self,
        field: impl Into<String>,
        payload: RelationshipPayload,
    ) -> Self {
        self.relationships.insert(field.into(), payload);
        self
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }
}

/// Error object as returned by the server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Pointer to the attribute or relationship this error refers to, e.g.
    /// `{ "pointer": "/data/attributes/name" }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

impl ApiError {
    pub fn new(status: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }
}

/// Top-level document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredDocument {
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<PrimaryData>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiError>,
}

impl StructuredDocument {
    pub fn single(resource: Resource) -> Self {
        Self {
            data: Some(PrimaryData::One(Some(resource))),
            ..Default::default()
        }
    }

    pub fn collection(resources: Vec<Resource>) -> Self {
        Self {
            data: Some(PrimaryData::Many(resources)),
            ..Default::default()
        }
    }

    pub fn with_included(mut self, resources: Vec<Resource>) -> Self {
        self.included.extend(resources);
        self
    }

    pub fn is_error_document(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Iterates over every resource in primary data followed by all included resources.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.data
            .iter()
            .flat_map(PrimaryData::resources)
            .chain(self.included.iter())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::identifier::ResourceIdentifier;

    use super::{Linkage, PrimaryData, StructuredDocument};

    #[test]
    fn null_and_absent_data() {
        let document: StructuredDocument = serde_json::from_value(json!({
            "data": null
        }))
        .unwrap();
        assert_eq!(document.data, Some(PrimaryData::One(None)));

        let document: StructuredDocument = serde_json::from_value(json!({
            "meta": { "total": 0 }
        }))
        .unwrap();
        assert_eq!(document.data, None);
    }

    #[test]
    fn relationship_linkage() {
        let document: StructuredDocument = serde_json::from_value(json!({
            "data": {
                "type": "user",
                "id": "1",
                "attributes": { "name": "Panda" },
                "relationships": {
                    "bestFriend": { "data": { "type": "user", "id": "2" } },
                    "pets": { "data": [] },
                    "company": { "data": null },
                    "posts": { "links": { "related": "/users/1/posts" } }
                }
            },
            "included": [{ "type": "user", "id": "2" }]
        }))
        .unwrap();

        let resource = document.resources().next().unwrap();
        assert_eq!(resource.attributes["name"], json!("Panda"));
        assert_matches!(
            &resource.relationships["bestFriend"].data,
            Some(Linkage::One(Some(identifier))) if identifier == &ResourceIdentifier::new("user", "2")
        );
        assert_matches!(&resource.relationships["pets"].data, Some(Linkage::Many(list)) if list.is_empty());
        assert_matches!(&resource.relationships["company"].data, Some(Linkage::One(None)));
        assert_matches!(&resource.relationships["posts"].data, None);

        assert_eq!(document.resources().count(), 2);
    }
}
