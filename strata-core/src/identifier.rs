// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::OnceCell;
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Reference to a resource as it appears in payloads: a type plus a server `id` and / or a local
/// `lid`.
///
/// This is the "raw" shape which can be sent over the wire. It carries no identity guarantees,
/// use the identifier cache to turn it into a stable `ResourceKey`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceIdentifier {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }

    /// Identifier for a resource which only exists on the client so far.
    pub fn local(resource_type: impl Into<String>, lid: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            lid: Some(lid.into()),
        }
    }

    pub fn with_lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }
}

impl From<&ResourceKey> for ResourceIdentifier {
    fn from(key: &ResourceKey) -> Self {
        key.to_identifier()
    }
}

struct KeyData {
    lid: String,
    resource_type: String,
    id: OnceCell<String>,
}

/// Stable local identity of a resource.
///
/// Keys are handed out by the identifier cache, which guarantees that there is exactly one live
/// `ResourceKey` per resource. Equality is therefore _reference_ equality: two keys are equal only
/// when they are clones of the same handle, even if their type, id and lid happen to match.
///
/// `lid` and `type` never change. `id` can be assigned exactly once, when the server hands out an
/// id for a resource which was created on the client.
#[derive(Clone)]
pub struct ResourceKey(Rc<KeyData>);

impl ResourceKey {
    /// Creates a fresh handle.
    ///
    /// Only the identifier cache should call this, keys created anywhere else are never equal to
    /// the ones the cache hands out.
    pub fn new(resource_type: impl Into<String>, id: Option<String>, lid: impl Into<String>) -> Self {
        let cell = OnceCell::new();
        if let Some(id) = id {
            let _ = cell.set(id);
        }

        Self(Rc::new(KeyData {
            lid: lid.into(),
            resource_type: resource_type.into(),
            id: cell,
        }))
    }

    pub fn lid(&self) -> &str {
        &self.0.lid
    }

    pub fn resource_type(&self) -> &str {
        &self.0.resource_type
    }

    pub fn id(&self) -> Option<&str> {
        self.0.id.get().map(String::as_str)
    }

    /// Assigns the server id.
    ///
    /// Returns `false` if an id was already set, in which case the key stays unchanged.
    pub fn assign_id(&self, id: impl Into<String>) -> bool {
        self.0.id.set(id.into()).is_ok()
    }

    /// Returns `true` if the resource has not been persisted by the server yet.
    pub fn is_new(&self) -> bool {
        self.0.id.get().is_none()
    }

    pub fn to_identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type().to_owned(),
            id: self.id().map(ToOwned::to_owned),
            lid: Some(self.lid().to_owned()),
        }
    }

    pub fn ptr_eq(&self, other: &ResourceKey) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ResourceKey {}

impl StdHash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.lid.hash(state);
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{} ({})", self.resource_type(), id, self.lid()),
            None => write!(f, "{}:<new> ({})", self.resource_type(), self.lid()),
        }
    }
}

impl fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceKey")
            .field("type", &self.resource_type())
            .field("id", &self.id())
            .field("lid", &self.lid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{ResourceIdentifier, ResourceKey};

    #[test]
    fn reference_equality() {
        let key_1 = ResourceKey::new("user", Some("1".into()), "@lid:user-1");
        let key_2 = ResourceKey::new("user", Some("1".into()), "@lid:user-1");

        assert_eq!(key_1, key_1.clone());
        assert_ne!(key_1, key_2);

        let set = HashSet::from([key_1.clone(), key_2.clone(), key_1.clone()]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn id_assigned_once() {
        let key = ResourceKey::new("user", None, "@lid:user-abc");
        assert!(key.is_new());

        assert!(key.assign_id("7"));
        assert!(!key.assign_id("8"));
        assert_eq!(key.id(), Some("7"));
        assert!(!key.is_new());
    }

    #[test]
    fn identifier_serde() {
        let identifier: ResourceIdentifier =
            serde_json::from_str(r#"{ "type": "user", "id": "1" }"#).unwrap();
        assert_eq!(identifier, ResourceIdentifier::new("user", "1"));

        let json = serde_json::to_string(&ResourceIdentifier::local("user", "@lid:x")).unwrap();
        assert_eq!(json, r#"{"type":"user","lid":"@lid:x"}"#);
    }
}
