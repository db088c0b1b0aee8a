// SPDX-License-Identifier: MIT OR Apache-2.0

//! Commit path writing server documents into identifiers, attributes, relationships and cached
//! documents as one unit.
use std::rc::Rc;

use serde_json::{Map, Value};
use strata_core::{
    Linkage, PrimaryData, RelationshipPayload, RequestKey, Resource, ResourceIdentifier,
    ResourceKey, Response, SchemaService, StructuredDocument,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::documents::{Content, Document, DocumentCache, DocumentEntry};
use crate::graph::{
    GraphBatch, GraphError, Operation, RelationshipGraph, RelationshipUpdate, RelationshipValue,
};
use crate::identifiers::{IdentifierCache, IdentityError};
use crate::notifications::{Bucket, NotificationManager, NotificationTarget};
use crate::resources::ResourceCache;

/// Document can't be committed. Raised before any state was written.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// All caches of a store, sharing one identifier space.
///
/// Cloning returns another handle to the same state.
#[derive(Clone)]
pub struct Cache {
    identifiers: IdentifierCache,
    graph: RelationshipGraph,
    resources: ResourceCache,
    documents: DocumentCache,
    notifications: NotificationManager,
    schema: Rc<dyn SchemaService>,
}

impl Cache {
    pub fn new(identifiers: IdentifierCache, schema: Rc<dyn SchemaService>) -> Self {
        let notifications = NotificationManager::new();
        Self {
            graph: RelationshipGraph::new(
                identifiers.clone(),
                schema.clone(),
                notifications.clone(),
            ),
            resources: ResourceCache::new(notifications.clone()),
            documents: DocumentCache::new(notifications.clone()),
            identifiers,
            notifications,
            schema,
        }
    }

    pub fn identifiers(&self) -> &IdentifierCache {
        &self.identifiers
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn resources(&self) -> &ResourceCache {
        &self.resources
    }

    pub fn documents(&self) -> &DocumentCache {
        &self.documents
    }

    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    pub fn schema(&self) -> &Rc<dyn SchemaService> {
        &self.schema
    }

    /// Opens a batch. Flushes and notifications are deferred until the outermost batch ends.
    pub fn join(&self) -> GraphBatch {
        self.graph.batch()
    }

    /// Creates a resource which only exists on the client so far.
    pub fn create(
        &self,
        resource_type: &str,
        attributes: Map<String, Value>,
    ) -> Result<ResourceKey, IdentityError> {
        let key = self.identifiers.create_for_new(resource_type)?;
        self.resources.create(&key, attributes);
        debug!(%key, "created new resource");
        Ok(key)
    }

    /// Writes every resource of the document into the caches.
    ///
    /// The whole document is validated first, nothing is written if any resource or relationship
    /// is invalid. Returns the primary data resolved to resource keys.
    pub fn push(&self, document: &StructuredDocument) -> Result<Option<Content>, CommitError> {
        self.validate(document)?;

        let _batch = self.join();
        for resource in document.resources() {
            self.push_resource(resource)?;
        }

        let content = document.data.as_ref().map(|data| {
            let mut keys = data
                .resources()
                .filter_map(|resource| self.identifiers.peek(&resource.identifier()));
            match data {
                PrimaryData::One(_) => Content::One(keys.next()),
                PrimaryData::Many(_) => Content::Many(keys.collect()),
            }
        });

        Ok(content)
    }

    /// Commits a response and stores it as the document of the request, if it has a key.
    pub fn put(&self, key: Option<&RequestKey>, response: &Response) -> Result<Document, CommitError> {
        let _batch = self.join();

        let mut entry = DocumentEntry {
            key: key.cloned(),
            response: response.meta.clone(),
            ..Default::default()
        };
        if let Some(document) = &response.content {
            entry.content = self.push(document)?;
            entry.links.clone_from(&document.links);
            entry.meta.clone_from(&document.meta);
        }

        if let Some(key) = key {
            self.documents.put(key, entry.clone());
        }

        Ok(Document::from(&entry))
    }

    /// Applies new identifier data and migrates state if that caused a merge.
    pub fn update_identifier(
        &self,
        key: &ResourceKey,
        data: &ResourceIdentifier,
    ) -> Result<ResourceKey, CommitError> {
        let updated = self.identifiers.update(key, data)?;

        if let Some(abandoned) = &updated.abandoned {
            self.graph.merge(&updated.key, abandoned)?;
            self.resources.migrate(&updated.key, abandoned);
            self.documents.replace_resource(abandoned, &updated.key);
        }

        if updated.id_assigned || updated.abandoned.is_some() {
            self.notifications.notify(
                NotificationTarget::Resource(updated.key.clone()),
                Bucket::Identity,
                None,
            );
        }

        Ok(updated.key)
    }

    /// Removes the resource from every cache and forgets its identifier.
    pub fn unload(&self, key: &ResourceKey) {
        let _batch = self.join();
        self.resources.unload(key);
        self.documents.remove_resource(key);
        self.graph.unload(key);
    }

    fn push_resource(&self, resource: &Resource) -> Result<ResourceKey, CommitError> {
        let identifier = resource.identifier();
        let key = self.identifiers.get_or_create(&identifier)?;
        let key = self.update_identifier(&key, &identifier)?;

        self.resources.upsert(&key, resource);

        for (field, payload) in &resource.relationships {
            if self.graph.definition(key.resource_type(), field)?.is_none() {
                warn!(%key, %field, "ignore unknown relationship");
                continue;
            }

            let payload = resolve(&self.identifiers, payload)?;
            self.graph.push(Operation::UpdateRelationship {
                record: key.clone(),
                field: field.clone(),
                payload,
            })?;
        }

        Ok(key)
    }

    /// Replays the commit of a document against a scratch copy of its identifiers.
    ///
    /// Resources of one document see the identifiers earlier resources and their relationships
    /// created, exactly like the commit itself does.
    fn validate(&self, document: &StructuredDocument) -> Result<(), CommitError> {
        let scratch = self.identifiers.scratch(&referenced(document));
        let identifiers = scratch.identifiers();

        for resource in document.resources() {
            let identifier = resource.identifier();
            let key = identifiers.get_or_create(&identifier)?;
            let updated = identifiers.update(&key, &identifier)?;

            if let Some(abandoned) = updated
                .abandoned
                .as_ref()
                .and_then(|abandoned| scratch.origin(abandoned))
            {
                self.graph.validate_merge(&updated.key, abandoned)?;
            }

            for (field, payload) in &resource.relationships {
                if self
                    .graph
                    .definition(updated.key.resource_type(), field)?
                    .is_none()
                {
                    continue;
                }

                self.graph.validate(&Operation::UpdateRelationship {
                    record: updated.key.clone(),
                    field: field.clone(),
                    payload: resolve(identifiers, payload)?,
                })?;
            }
        }

        Ok(())
    }
}

fn resolve(
    identifiers: &IdentifierCache,
    payload: &RelationshipPayload,
) -> Result<RelationshipUpdate, CommitError> {
    let data = match &payload.data {
        Some(Linkage::One(identifier)) => Some(RelationshipValue::One(
            identifier
                .as_ref()
                .map(|identifier| identifiers.get_or_create(identifier))
                .transpose()?,
        )),
        Some(Linkage::Many(members)) => Some(RelationshipValue::Many(
            members
                .iter()
                .map(|identifier| identifiers.get_or_create(identifier))
                .collect::<Result<_, _>>()?,
        )),
        None => None,
    };

    Ok(RelationshipUpdate {
        data,
        links: payload.links.clone(),
        meta: payload.meta.clone(),
    })
}

/// Every identifier a document mentions, as resource or as relationship member.
fn referenced(document: &StructuredDocument) -> Vec<ResourceIdentifier> {
    let mut identifiers = Vec::new();
    for resource in document.resources() {
        identifiers.push(resource.identifier());
        for payload in resource.relationships.values() {
            match &payload.data {
                Some(Linkage::One(Some(identifier))) => identifiers.push(identifier.clone()),
                Some(Linkage::Many(members)) => identifiers.extend(members.iter().cloned()),
                Some(Linkage::One(None)) | None => (),
            }
        }
    }
    identifiers
}
