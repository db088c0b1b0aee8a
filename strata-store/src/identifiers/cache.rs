// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use strata_core::{ResourceIdentifier, ResourceKey};
use tracing::{debug, trace};

use crate::identifiers::{IdentifierConfig, IdentityError};

#[derive(Debug, Default)]
struct Indices {
    lids: HashMap<String, ResourceKey>,
    ids: HashMap<(String, String), ResourceKey>,
}

enum Plan {
    Unchanged,
    Merge(ResourceKey),
    AssignId(String),
}

/// Outcome of `IdentifierCache::update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Updated {
    /// Identifier to use from now on. Differs from the updated key when it was abandoned by a
    /// merge.
    pub key: ResourceKey,

    /// Identifier which was abandoned by a merge. Whoever holds state for it needs to migrate or
    /// drop it.
    pub abandoned: Option<ResourceKey>,

    /// The surviving identifier received its server id with this update.
    pub id_assigned: bool,
}

impl Updated {
    fn unchanged(key: &ResourceKey) -> Self {
        Self {
            key: key.clone(),
            abandoned: None,
            id_assigned: false,
        }
    }
}

/// Throwaway copy of the identifiers a document references, see `IdentifierCache::scratch`.
pub struct Scratch {
    identifiers: IdentifierCache,
    origins: HashMap<ResourceKey, ResourceKey>,
}

impl Scratch {
    pub fn identifiers(&self) -> &IdentifierCache {
        &self.identifiers
    }

    /// Live key a scratch key was copied from, `None` for keys created in the scratch.
    pub fn origin(&self, key: &ResourceKey) -> Option<&ResourceKey> {
        self.origins.get(key)
    }
}

/// Generates, looks up, merges and forgets resource identities.
#[derive(Clone, Debug, Default)]
pub struct IdentifierCache {
    indices: Rc<RefCell<Indices>>,
    config: Rc<IdentifierConfig>,

    /// Indices of the cache a scratch was taken from. Generated lids must not collide with them.
    base: Option<Rc<RefCell<Indices>>>,
}

impl IdentifierCache {
    pub fn new(config: IdentifierConfig) -> Self {
        Self {
            indices: Rc::default(),
            config: Rc::new(config),
            base: None,
        }
    }

    /// Copies every key reachable from the given identifiers into a detached cache.
    ///
    /// Replaying a commit against the scratch raises the same identity errors the commit would
    /// raise, while this cache stays untouched. Scratch keys are fresh copies and the scratch
    /// runs without `update` and `forget` observers.
    pub fn scratch<'a>(
        &self,
        identifiers: impl IntoIterator<Item = &'a ResourceIdentifier>,
    ) -> Scratch {
        let indices = self.indices.borrow();
        let mut copies = HashMap::new();
        let mut scratch = Indices::default();

        for identifier in identifiers {
            if let Some(lid) = &identifier.lid
                && let Some(key) = indices.lids.get(lid)
            {
                let copy = copy_key(&mut copies, &mut scratch, key);
                scratch.lids.insert(lid.clone(), copy);
            }

            if let Some(id) = &identifier.id {
                let index = (identifier.resource_type.clone(), id.clone());
                if let Some(key) = indices.ids.get(&index) {
                    let copy = copy_key(&mut copies, &mut scratch, key);
                    scratch.ids.insert(index, copy);
                }
            }
        }

        let config = IdentifierConfig {
            update: None,
            forget: None,
            ..(*self.config).clone()
        };

        Scratch {
            identifiers: IdentifierCache {
                indices: Rc::new(RefCell::new(scratch)),
                config: Rc::new(config),
                base: Some(self.indices.clone()),
            },
            origins: copies.into_iter().map(|(key, copy)| (copy, key)).collect(),
        }
    }

    /// Returns the key for the given resource, creating it on first sight.
    ///
    /// A known `lid` always wins. Otherwise the resource is looked up by `(type, id)`, an unknown
    /// `lid` supplied alongside becomes an alias of the found key.
    pub fn get_or_create(
        &self,
        identifier: &ResourceIdentifier,
    ) -> Result<ResourceKey, IdentityError> {
        if let Some(key) = self.lookup(identifier)? {
            return Ok(key);
        }

        let lid = match &identifier.lid {
            Some(lid) => lid.clone(),
            None => (self.config.generate)(identifier),
        };

        let mut indices = self.indices.borrow_mut();
        let existing = indices.lids.get(&lid).map(ToString::to_string).or_else(|| {
            self.base
                .as_ref()
                .and_then(|base| base.borrow().lids.get(&lid).map(ToString::to_string))
        });
        if let Some(existing) = existing {
            return Err(IdentityError::DuplicateLid { lid, existing });
        }

        let key = ResourceKey::new(
            identifier.resource_type.clone(),
            identifier.id.clone(),
            lid.clone(),
        );
        indices.lids.insert(lid, key.clone());
        if let Some(id) = &identifier.id {
            indices
                .ids
                .insert((identifier.resource_type.clone(), id.clone()), key.clone());
        }

        trace!(%key, "create identifier");
        Ok(key)
    }

    /// Same lookup as `get_or_create` but never creates or aliases anything.
    pub fn peek(&self, identifier: &ResourceIdentifier) -> Option<ResourceKey> {
        let indices = self.indices.borrow();
        if let Some(key) = identifier
            .lid
            .as_ref()
            .and_then(|lid| indices.lids.get(lid))
        {
            return Some(key.clone());
        }

        identifier.id.as_ref().and_then(|id| {
            indices
                .ids
                .get(&(identifier.resource_type.clone(), id.clone()))
                .cloned()
        })
    }

    /// Validates a reference without touching the indices.
    pub fn check(&self, identifier: &ResourceIdentifier) -> Result<(), IdentityError> {
        let indices = self.indices.borrow();
        let Some(lid) = &identifier.lid else {
            return Ok(());
        };
        let Some(key) = indices.lids.get(lid) else {
            return Ok(());
        };
        check_lid(key, lid, identifier)
    }

    /// Returns `true` if the key is the live identifier for its lid.
    pub fn is_known(&self, key: &ResourceKey) -> bool {
        self.indices.borrow().lids.get(key.lid()) == Some(key)
    }

    /// Creates an identifier for a resource which only exists on the client.
    pub fn create_for_new(&self, resource_type: &str) -> Result<ResourceKey, IdentityError> {
        self.get_or_create(&ResourceIdentifier {
            resource_type: resource_type.to_owned(),
            id: None,
            lid: None,
        })
    }

    /// Applies new data to an identifier.
    ///
    /// Assigns the id when it was missing so far. `lid` never changes and neither does a non-null
    /// `id`. If the new `(type, id)` is already taken by another key, both keys get merged and the
    /// merge hook decides which one survives.
    ///
    /// Updating a forgotten key does nothing.
    pub fn update(
        &self,
        key: &ResourceKey,
        data: &ResourceIdentifier,
    ) -> Result<Updated, IdentityError> {
        if !self.is_known(key) {
            return Ok(Updated::unchanged(key));
        }

        let id = match self.plan(key, data)? {
            Plan::Unchanged => return Ok(Updated::unchanged(key)),
            Plan::Merge(matched) => return self.merge(key, &matched, data),
            Plan::AssignId(id) => id,
        };

        key.assign_id(id.clone());
        self.indices
            .borrow_mut()
            .ids
            .insert((key.resource_type().to_owned(), id), key.clone());
        debug!(%key, "assigned id to identifier");

        if let Some(hook) = &self.config.update {
            hook(key);
        }

        Ok(Updated {
            key: key.clone(),
            abandoned: None,
            id_assigned: true,
        })
    }

    /// Runs every check of `update` without changing anything.
    pub fn validate_update(
        &self,
        key: &ResourceKey,
        data: &ResourceIdentifier,
    ) -> Result<(), IdentityError> {
        if !self.is_known(key) {
            return Ok(());
        }
        self.plan(key, data).map(|_| ())
    }

    fn plan(&self, key: &ResourceKey, data: &ResourceIdentifier) -> Result<Plan, IdentityError> {
        let indices = self.indices.borrow();

        if let Some(lid) = &data.lid
            && lid != key.lid()
            && indices.lids.get(lid) != Some(key)
        {
            return Err(IdentityError::LidChange {
                key: key.to_string(),
                lid: lid.clone(),
            });
        }

        let type_changed = data.resource_type != key.resource_type();
        let (id_changed, id_assigned) = match (key.id(), data.id.as_deref()) {
            (Some(current), Some(id)) => (current != id, false),
            (None, Some(_)) => (false, true),
            _ => (false, false),
        };

        if type_changed && (id_changed || id_assigned) {
            return Err(IdentityError::AmbiguousUpdate {
                key: key.to_string(),
            });
        }

        if id_changed {
            return Err(IdentityError::IdChange {
                key: key.to_string(),
                id: data.id.clone().unwrap_or_default(),
            });
        }

        if type_changed {
            let matched = key
                .id()
                .and_then(|id| indices.ids.get(&(data.resource_type.clone(), id.to_owned())));

            return match matched {
                // Already merged earlier, the old type is an alias now.
                Some(matched) if matched == key => Ok(Plan::Unchanged),
                Some(matched) => Ok(Plan::Merge(matched.clone())),
                None => Err(IdentityError::TypeChange {
                    key: key.to_string(),
                    resource_type: data.resource_type.clone(),
                }),
            };
        }

        let Some(id) = data.id.as_ref().filter(|_| id_assigned) else {
            return Ok(Plan::Unchanged);
        };

        match indices.ids.get(&(key.resource_type().to_owned(), id.clone())) {
            Some(matched) => Ok(Plan::Merge(matched.clone())),
            None => Ok(Plan::AssignId(id.clone())),
        }
    }

    /// Removes every index entry of the key.
    ///
    /// This does not cascade, callers need to drop all other state of the key first.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        let removed = {
            let mut indices = self.indices.borrow_mut();
            let before = indices.lids.len();
            indices.lids.retain(|_, value| value != key);
            indices.ids.retain(|_, value| value != key);
            before != indices.lids.len()
        };

        if removed {
            trace!(%key, "forget identifier");
            if let Some(hook) = &self.config.forget {
                hook(key);
            }
        }

        removed
    }

    /// Forgets all identifiers.
    pub fn reset(&self) {
        let mut indices = self.indices.borrow_mut();
        indices.lids.clear();
        indices.ids.clear();
    }

    fn lookup(&self, identifier: &ResourceIdentifier) -> Result<Option<ResourceKey>, IdentityError> {
        let mut indices = self.indices.borrow_mut();

        if let Some(lid) = &identifier.lid
            && let Some(key) = indices.lids.get(lid)
        {
            check_lid(key, lid, identifier)?;
            return Ok(Some(key.clone()));
        }

        let Some(id) = &identifier.id else {
            return Ok(None);
        };

        let Some(key) = indices
            .ids
            .get(&(identifier.resource_type.clone(), id.clone()))
            .cloned()
        else {
            return Ok(None);
        };

        if let Some(lid) = &identifier.lid {
            trace!(%key, alias = %lid, "alias lid");
            indices.lids.insert(lid.clone(), key.clone());
        }

        Ok(Some(key))
    }

    fn merge(
        &self,
        target: &ResourceKey,
        matched: &ResourceKey,
        data: &ResourceIdentifier,
    ) -> Result<Updated, IdentityError> {
        let kept = (self.config.merge)(target, matched, data);
        let abandoned = if &kept == target {
            matched.clone()
        } else if &kept == matched {
            target.clone()
        } else {
            return Err(IdentityError::InvalidMergeResult {
                target: target.to_string(),
                matched: matched.to_string(),
                result: kept.to_string(),
            });
        };

        let id_assigned = match &data.id {
            Some(id) if kept.id().is_none() => kept.assign_id(id.clone()),
            _ => false,
        };

        {
            let mut indices = self.indices.borrow_mut();
            let indices = &mut *indices;
            for value in indices
                .lids
                .values_mut()
                .chain(indices.ids.values_mut())
            {
                if value == &abandoned {
                    *value = kept.clone();
                }
            }

            if let Some(id) = kept.id() {
                indices
                    .ids
                    .insert((kept.resource_type().to_owned(), id.to_owned()), kept.clone());
            }
            if let Some(id) = &data.id {
                indices
                    .ids
                    .insert((data.resource_type.clone(), id.clone()), kept.clone());
            }
        }

        debug!(%kept, %abandoned, "merged identifiers");

        if let Some(hook) = &self.config.update {
            hook(&kept);
        }
        if let Some(hook) = &self.config.forget {
            hook(&abandoned);
        }

        Ok(Updated {
            key: kept,
            abandoned: Some(abandoned),
            id_assigned,
        })
    }
}

fn copy_key(
    copies: &mut HashMap<ResourceKey, ResourceKey>,
    scratch: &mut Indices,
    key: &ResourceKey,
) -> ResourceKey {
    if let Some(copy) = copies.get(key) {
        return copy.clone();
    }

    let copy = ResourceKey::new(
        key.resource_type(),
        key.id().map(ToOwned::to_owned),
        key.lid(),
    );
    scratch.lids.insert(key.lid().to_owned(), copy.clone());
    if let Some(id) = key.id() {
        scratch
            .ids
            .insert((key.resource_type().to_owned(), id.to_owned()), copy.clone());
    }
    copies.insert(key.clone(), copy.clone());
    copy
}

fn check_lid(
    key: &ResourceKey,
    lid: &str,
    identifier: &ResourceIdentifier,
) -> Result<(), IdentityError> {
    match (key.id(), identifier.id.as_deref()) {
        (Some(existing), Some(id))
            if existing != id && key.resource_type() == identifier.resource_type =>
        {
            Err(IdentityError::LidMismatch {
                lid: lid.to_owned(),
                existing: key.to_string(),
                id: id.to_owned(),
            })
        }
        _ => Ok(()),
    }
}
