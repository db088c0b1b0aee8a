// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attribute state of resources.
//!
//! Each resource keeps the attributes confirmed by the server (`remote`), uncommitted client
//! changes on top (`local`) and a snapshot of the changes currently being saved (`in_flight`).
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::{Map, Value};
use strata_core::{ApiError, Resource, ResourceKey};
use tracing::trace;

use crate::notifications::{Bucket, NotificationManager, NotificationTarget};

#[derive(Clone, Debug, Default, PartialEq)]
struct ResourceEntry {
    remote: Map<String, Value>,
    local: Map<String, Value>,
    in_flight: Option<Map<String, Value>>,
    errors: Vec<ApiError>,
    is_deleted: bool,
    links: Option<Value>,
    meta: Option<Value>,
}

impl ResourceEntry {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.local
            .get(name)
            .or_else(|| self.in_flight.as_ref().and_then(|saving| saving.get(name)))
            .or_else(|| self.remote.get(name))
    }
}

/// Attribute value before and after a local change.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeChange {
    pub remote: Option<Value>,
    pub local: Value,
}

#[derive(Clone, Default)]
pub struct ResourceCache {
    entries: Rc<RefCell<HashMap<ResourceKey, ResourceEntry>>>,
    notifications: NotificationManager,
}

impl ResourceCache {
    pub fn new(notifications: NotificationManager) -> Self {
        Self {
            entries: Rc::default(),
            notifications,
        }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Creates the entry of a resource which only exists on the client, all attributes are
    /// local changes.
    pub fn create(&self, key: &ResourceKey, attributes: Map<String, Value>) {
        self.entries.borrow_mut().insert(
            key.clone(),
            ResourceEntry {
                local: attributes,
                ..Default::default()
            },
        );
        self.notify(key, Bucket::State, None);
    }

    /// Writes server data.
    ///
    /// Returns the names of attributes whose remote value changed. Subscribers are only notified
    /// about changes which are not hidden by a local change.
    pub fn upsert(&self, key: &ResourceKey, resource: &Resource) -> Vec<String> {
        let (changed, visible) = {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.entry(key.clone()).or_default();

            let mut changed = Vec::new();
            let mut visible = Vec::new();
            for (name, value) in &resource.attributes {
                if entry.remote.get(name) == Some(value) {
                    continue;
                }
                entry.remote.insert(name.clone(), value.clone());
                changed.push(name.clone());
                if !entry.local.contains_key(name) {
                    visible.push(name.clone());
                }
            }

            if resource.links.is_some() {
                entry.links.clone_from(&resource.links);
            }
            if resource.meta.is_some() {
                entry.meta.clone_from(&resource.meta);
            }

            (changed, visible)
        };

        for name in &visible {
            self.notify(key, Bucket::Attributes, Some(name));
        }
        changed
    }

    pub fn get_attr(&self, key: &ResourceKey, name: &str) -> Option<Value> {
        self.entries
            .borrow()
            .get(key)
            .and_then(|entry| entry.attribute(name).cloned())
    }

    /// All attributes as currently visible, local changes included.
    pub fn attributes(&self, key: &ResourceKey) -> Map<String, Value> {
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(key) else {
            return Map::new();
        };

        let mut attributes = entry.remote.clone();
        if let Some(saving) = &entry.in_flight {
            attributes.extend(saving.clone());
        }
        attributes.extend(entry.local.clone());
        attributes
    }

    /// Changes an attribute locally. Setting it back to the remote value drops the change.
    pub fn set_attr(&self, key: &ResourceKey, name: &str, value: Value) {
        let changed = {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.entry(key.clone()).or_default();
            let previous = entry.attribute(name).cloned();

            if entry.remote.get(name) == Some(&value) && entry.in_flight.is_none() {
                entry.local.remove(name);
            } else {
                entry.local.insert(name.to_owned(), value.clone());
            }

            previous.as_ref() != Some(&value)
        };

        if changed {
            self.notify(key, Bucket::Attributes, Some(name));
        }
    }

    pub fn changed_attributes(&self, key: &ResourceKey) -> BTreeMap<String, AttributeChange> {
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(key) else {
            return BTreeMap::new();
        };

        entry
            .local
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    AttributeChange {
                        remote: entry.remote.get(name).cloned(),
                        local: value.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn has_changed_attributes(&self, key: &ResourceKey) -> bool {
        self.entries
            .borrow()
            .get(key)
            .is_some_and(|entry| !entry.local.is_empty())
    }

    /// Drops all local changes. Returns the names of the attributes which were reset.
    pub fn rollback_attributes(&self, key: &ResourceKey) -> Vec<String> {
        let names: Vec<String> = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(key) else {
                return Vec::new();
            };
            entry.errors.clear();
            let local = std::mem::take(&mut entry.local);
            local.into_iter().map(|(name, _)| name).collect()
        };

        for name in &names {
            self.notify(key, Bucket::Attributes, Some(name));
        }
        names
    }

    /// Marks the current local changes as being saved.
    pub fn will_commit(&self, key: &ResourceKey) {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(key.clone()).or_default();
        entry.in_flight = Some(entry.local.clone());
    }

    /// The save was accepted by the server.
    ///
    /// Saved values become remote state, server data (if any) is applied on top. Local changes
    /// made while the save was in flight are kept.
    pub fn did_commit(&self, key: &ResourceKey, resource: Option<&Resource>) {
        {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.entry(key.clone()).or_default();
            if let Some(saved) = entry.in_flight.take() {
                for (name, value) in saved {
                    if entry.local.get(&name) == Some(&value) {
                        entry.local.remove(&name);
                    }
                    entry.remote.insert(name, value);
                }
            }
            entry.errors.clear();
        }

        if let Some(resource) = resource {
            self.upsert(key, resource);
        }

        trace!(%key, "commit accepted");
        self.notify(key, Bucket::State, None);
    }

    /// The save was rejected. Local changes stay untouched, server errors are attached.
    pub fn commit_was_rejected(&self, key: &ResourceKey, errors: Vec<ApiError>) {
        {
            let mut entries = self.entries.borrow_mut();
            let entry = entries.entry(key.clone()).or_default();
            entry.in_flight = None;
            entry.errors = errors;
        }

        trace!(%key, "commit rejected");
        self.notify(key, Bucket::State, None);
    }

    /// The save was aborted before the server answered. Errors of earlier saves are kept.
    pub fn commit_was_aborted(&self, key: &ResourceKey) {
        let aborted = self
            .entries
            .borrow_mut()
            .get_mut(key)
            .and_then(|entry| entry.in_flight.take())
            .is_some();

        if aborted {
            trace!(%key, "commit aborted");
            self.notify(key, Bucket::State, None);
        }
    }

    pub fn errors(&self, key: &ResourceKey) -> Vec<ApiError> {
        self.entries
            .borrow()
            .get(key)
            .map(|entry| entry.errors.clone())
            .unwrap_or_default()
    }

    pub fn is_new(&self, key: &ResourceKey) -> bool {
        key.is_new()
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.entries
            .borrow()
            .get(key)
            .is_some_and(|entry| entry.in_flight.is_some())
    }

    pub fn mark_deleted(&self, key: &ResourceKey) {
        self.entries
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .is_deleted = true;
        self.notify(key, Bucket::State, None);
    }

    pub fn is_deleted(&self, key: &ResourceKey) -> bool {
        self.entries
            .borrow()
            .get(key)
            .is_some_and(|entry| entry.is_deleted)
    }

    /// Snapshot of the resource with all currently visible attributes, used to serialize saves.
    pub fn peek(&self, key: &ResourceKey) -> Option<Resource> {
        let (links, meta) = {
            let entries = self.entries.borrow();
            let entry = entries.get(key)?;
            (entry.links.clone(), entry.meta.clone())
        };

        Some(Resource {
            resource_type: key.resource_type().to_owned(),
            id: key.id().map(ToOwned::to_owned),
            lid: Some(key.lid().to_owned()),
            attributes: self.attributes(key),
            relationships: BTreeMap::new(),
            links,
            meta,
        })
    }

    /// Folds the state of an identifier abandoned by a merge into the surviving one.
    ///
    /// Remote values of the survivor win, local changes of the abandoned resource are kept unless
    /// the survivor has its own.
    pub fn migrate(&self, kept: &ResourceKey, abandoned: &ResourceKey) {
        let mut entries = self.entries.borrow_mut();
        let Some(old) = entries.remove(abandoned) else {
            return;
        };

        let entry = entries.entry(kept.clone()).or_default();
        for (name, value) in old.remote {
            entry.remote.entry(name).or_insert(value);
        }
        for (name, value) in old.local {
            entry.local.entry(name).or_insert(value);
        }
        if entry.in_flight.is_none() {
            entry.in_flight = old.in_flight;
        }
        if entry.errors.is_empty() {
            entry.errors = old.errors;
        }
    }

    pub fn unload(&self, key: &ResourceKey) -> bool {
        self.entries.borrow_mut().remove(key).is_some()
    }

    fn notify(&self, key: &ResourceKey, bucket: Bucket, name: Option<&str>) {
        self.notifications
            .notify(NotificationTarget::Resource(key.clone()), bucket, name);
    }
}
