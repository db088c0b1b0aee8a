// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use strata_core::{
    ApiError, Linkage, Method, RelationshipPayload, RequestInfo, RequestKey, RequestOp, Resource,
    ResourceIdentifier, ResourceKey, SchemaService, StructuredDocument,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builder::StoreBuilder;
use crate::cache::{Cache, CommitError};
use crate::documents::{Content, Document};
use crate::graph::{GraphBatch, GraphError, Operation, RelationshipState, RelationshipValue};
use crate::identifiers::{IdentifierCache, IdentityError};
use crate::notifications::{Notification, NotificationTarget, SubscriptionId};
use crate::requests::{CachePolicy, DefaultCachePolicy, Handler, RequestCoordinator, RequestError};

/// Entry point for reading, mutating and saving resources.
///
/// Every handle shares the same caches, cloning is cheap. All futures returned by the store are
/// `!Send` and need to run inside a `tokio::task::LocalSet`.
pub struct Store<H, P = DefaultCachePolicy> {
    cache: Cache,
    coordinator: RequestCoordinator<H, P>,
}

impl<H, P> Clone for Store<H, P> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<H> Store<H>
where
    H: Handler + 'static,
{
    pub fn builder(schema: impl SchemaService + 'static, handler: H) -> StoreBuilder<H> {
        StoreBuilder::new(schema, handler)
    }
}

impl<H, P> Store<H, P>
where
    H: Handler + 'static,
    P: CachePolicy + 'static,
{
    pub(crate) fn from_parts(cache: Cache, coordinator: RequestCoordinator<H, P>) -> Self {
        Self { cache, coordinator }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator<H, P> {
        &self.coordinator
    }

    pub fn identifiers(&self) -> &IdentifierCache {
        self.cache.identifiers()
    }

    pub fn policy(&self) -> &P {
        self.coordinator.policy()
    }

    /// Opens a batch, see `Cache::join`.
    pub fn join(&self) -> GraphBatch {
        self.cache.join()
    }

    pub fn create_record(
        &self,
        resource_type: &str,
        attributes: Map<String, Value>,
    ) -> Result<ResourceKey, IdentityError> {
        self.cache.create(resource_type, attributes)
    }

    pub fn push(&self, document: &StructuredDocument) -> Result<Option<Content>, CommitError> {
        self.cache.push(document)
    }

    /// Snapshot of a known resource with its current attributes and relationships.
    pub fn peek_record(&self, identifier: &ResourceIdentifier) -> Option<Resource> {
        let key = self.cache.identifiers().peek(identifier)?;
        Some(self.snapshot(&key))
    }

    pub fn get_attr(&self, key: &ResourceKey, name: &str) -> Option<Value> {
        self.cache.resources().get_attr(key, name)
    }

    pub fn set_attr(&self, key: &ResourceKey, name: &str, value: Value) {
        self.cache.resources().set_attr(key, name, value);
    }

    pub fn rollback_attributes(&self, key: &ResourceKey) -> Vec<String> {
        self.cache.resources().rollback_attributes(key)
    }

    /// Server errors of the last rejected save.
    pub fn errors(&self, key: &ResourceKey) -> Vec<ApiError> {
        self.cache.resources().errors(key)
    }

    pub fn relationship(
        &self,
        key: &ResourceKey,
        field: &str,
    ) -> Result<RelationshipState, GraphError> {
        self.cache.graph().get_data(key, field)
    }

    pub fn update_relationship(&self, operation: Operation) -> Result<(), GraphError> {
        self.cache.graph().push(operation)
    }

    pub fn unload_record(&self, key: &ResourceKey) {
        self.cache.unload(key);
    }

    pub async fn request(&self, request: RequestInfo) -> Result<Document, RequestError> {
        self.coordinator.request(request).await
    }

    pub async fn request_with_signal(
        &self,
        request: RequestInfo,
        signal: Option<CancellationToken>,
    ) -> Result<Document, RequestError> {
        self.coordinator.request_with_signal(request, signal).await
    }

    pub fn remove_document(&self, key: &RequestKey) -> bool {
        self.coordinator.remove_document(key)
    }

    pub async fn find_record(&self, resource_type: &str, id: &str) -> Result<Document, RequestError> {
        let request = RequestInfo::get(format!("/{resource_type}/{id}"))
            .with_op(RequestOp::FindRecord);
        self.coordinator.request(request).await
    }

    /// Marks the resource as deleted and removes it from the local side of all relationships.
    ///
    /// Resources which were never saved are unloaded right away.
    pub fn delete_record(&self, key: &ResourceKey) -> Result<(), GraphError> {
        if key.is_new() {
            self.cache.unload(key);
            return Ok(());
        }

        let _batch = self.join();
        self.cache.resources().mark_deleted(key);
        self.cache.graph().push(Operation::DeleteRecord {
            record: key.clone(),
            is_new: false,
        })
    }

    /// Sends pending changes of the resource to the server.
    ///
    /// New resources are created, deleted ones are deleted and all others updated.
    pub async fn save_record(&self, key: &ResourceKey) -> Result<Document, RequestError> {
        if !self.cache.identifiers().is_known(key) {
            debug!(%key, "resource was unloaded, nothing to save");
            return Ok(Document::default());
        }

        let resource_type = key.resource_type();
        let request = match (self.cache.resources().is_deleted(key), key.id()) {
            (true, Some(id)) => RequestInfo::new(Method::Delete, format!("/{resource_type}/{id}"))
                .with_op(RequestOp::DeleteRecord),
            (false, Some(id)) => RequestInfo::new(Method::Patch, format!("/{resource_type}/{id}"))
                .with_op(RequestOp::UpdateRecord)
                .with_body(self.body(key)?),
            (_, None) => RequestInfo::new(Method::Post, format!("/{resource_type}"))
                .with_op(RequestOp::CreateRecord)
                .with_body(self.body(key)?),
        };

        self.coordinator
            .request(request.with_record(key.clone()))
            .await
    }

    pub fn subscribe(
        &self,
        target: Option<NotificationTarget>,
        callback: impl Fn(&Notification) + 'static,
    ) -> SubscriptionId {
        self.cache.notifications().subscribe(target, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cache.notifications().unsubscribe(id)
    }

    fn body(&self, key: &ResourceKey) -> Result<Value, RequestError> {
        serde_json::to_value(StructuredDocument::single(self.snapshot(key)))
            .map_err(|err| RequestError::Serialize(err.to_string()))
    }

    fn snapshot(&self, key: &ResourceKey) -> Resource {
        let mut resource = self.cache.resources().peek(key).unwrap_or_else(|| Resource {
            resource_type: key.resource_type().to_owned(),
            id: key.id().map(ToOwned::to_owned),
            lid: Some(key.lid().to_owned()),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
            links: None,
            meta: None,
        });

        for (name, field) in self.cache.schema().fields(key) {
            if !field.is_relationship() {
                continue;
            }
            let Ok(state) = self.cache.graph().get_data(key, &name) else {
                continue;
            };

            let data = match state.data {
                RelationshipValue::One(related) => {
                    Linkage::One(related.as_ref().map(ResourceKey::to_identifier))
                }
                RelationshipValue::Many(related) => {
                    Linkage::Many(related.iter().map(ResourceKey::to_identifier).collect())
                }
            };
            resource.relationships.insert(
                name,
                RelationshipPayload {
                    data: Some(data),
                    links: state.links,
                    meta: state.meta,
                },
            );
        }

        resource
    }
}
