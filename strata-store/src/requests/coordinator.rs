// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures_util::FutureExt;
use futures_util::future::{LocalBoxFuture, Shared};
use strata_core::{
    FetchError, PrimaryData, RequestInfo, RequestKey, RequestOp, Response, ResponseMeta,
    StructuredDocument,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::Cache;
use crate::documents::{Content, Document, DocumentEntry};
use crate::requests::{CachePolicy, Handler, RequestError};

type SharedFetch = Shared<LocalBoxFuture<'static, Result<Document, RequestError>>>;

/// Priority of an in-flight request. A caller waiting for the result makes it blocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background,
    Blocking,
}

struct InFlight {
    id: u64,
    priority: Priority,
    fetch: SharedFetch,
}

type Registry = Rc<RefCell<HashMap<RequestKey, InFlight>>>;

/// Removes the registry entry of a request once it settled, also when the task got dropped.
struct InFlightGuard {
    registry: Registry,
    key: Option<RequestKey>,
    id: u64,
}

impl InFlightGuard {
    /// Removes the entry and returns the priority it had when the request settled.
    fn settle(&mut self) -> Priority {
        let Some(key) = self.key.take() else {
            return Priority::Blocking;
        };

        let mut registry = self.registry.borrow_mut();
        match registry.get(&key) {
            Some(entry) if entry.id == self.id => registry
                .remove(&key)
                .map_or(Priority::Blocking, |entry| entry.priority),
            _ => Priority::Blocking,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Answers requests from the document cache or through the handler chain.
///
/// At most one request per `RequestKey` is in flight, later callers share its result. Fetched
/// documents are committed into the cache before any caller sees them.
pub struct RequestCoordinator<H, P> {
    cache: Cache,
    handler: Rc<H>,
    policy: Rc<P>,
    registry: Registry,
    next_id: Rc<Cell<u64>>,
}

impl<H, P> Clone for RequestCoordinator<H, P> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            handler: self.handler.clone(),
            policy: self.policy.clone(),
            registry: self.registry.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<H, P> RequestCoordinator<H, P>
where
    H: Handler + 'static,
    P: CachePolicy + 'static,
{
    pub fn new(cache: Cache, handler: H, policy: P) -> Self {
        Self {
            cache,
            handler: Rc::new(handler),
            policy: Rc::new(policy),
            registry: Rc::default(),
            next_id: Rc::default(),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns `true` while a request for this key is outstanding.
    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.registry.borrow().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Drops the cached document of a request and everything the policy tracks for it.
    pub fn remove_document(&self, key: &RequestKey) -> bool {
        let removed = self.cache.documents().remove(key);
        self.policy.did_remove(key);
        removed
    }

    pub async fn request(&self, request: RequestInfo) -> Result<Document, RequestError> {
        self.request_with_signal(request, None).await
    }

    /// Resolves a request.
    ///
    /// Cancelling the signal only aborts waiting for this caller, the fetch itself continues and
    /// other callers still receive its result.
    ///
    /// Background refreshes are spawned on the current `LocalSet`.
    pub async fn request_with_signal(
        &self,
        request: RequestInfo,
        signal: Option<CancellationToken>,
    ) -> Result<Document, RequestError> {
        let Some(key) = request.request_key() else {
            let fetch = self.fetch(None, request, Priority::Blocking);
            return wait(fetch, signal).await;
        };

        // Entries holding only an error never count as cached, they'd never expire otherwise.
        let entry = self
            .cache
            .documents()
            .peek(&key)
            .filter(|entry| entry.content.is_some() || entry.error.is_none());

        let entry = match entry {
            Some(entry)
                if !request.is_mutation()
                    && !request.cache_options.reload
                    && !self.policy.is_hard_expired(&key) =>
            {
                entry
            }
            _ => {
                let fetch = self.fetch(Some(key), request, Priority::Blocking);
                return wait(fetch, signal).await;
            }
        };

        if request.cache_options.background_reload || self.policy.is_soft_expired(&key) {
            trace!(%key, "refresh document in background");
            drop(self.fetch(Some(key.clone()), request, Priority::Background));
        }

        serve(entry)
    }

    /// Returns the pending fetch for the key or starts a new one.
    fn fetch(&self, key: Option<RequestKey>, request: RequestInfo, priority: Priority) -> SharedFetch {
        if let Some(key) = &key
            && let Some(existing) = self.registry.borrow_mut().get_mut(key)
        {
            if priority > existing.priority {
                trace!(%key, "raise priority of pending request");
                existing.priority = priority;
            }
            trace!(%key, "deduplicate request");
            return existing.fetch.clone();
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let coordinator = self.clone();
        let task_key = key.clone();
        let handle =
            tokio::task::spawn_local(async move { coordinator.execute(id, task_key, request).await });

        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%err, "request task did not complete");
                    Err(RequestError::Aborted)
                }
            }
        }
        .boxed_local()
        .shared();

        if let Some(key) = key {
            self.registry.borrow_mut().insert(
                key,
                InFlight {
                    id,
                    priority,
                    fetch: fetch.clone(),
                },
            );
        }

        fetch
    }

    async fn execute(
        self,
        id: u64,
        key: Option<RequestKey>,
        request: RequestInfo,
    ) -> Result<Document, RequestError> {
        let mut guard = InFlightGuard {
            registry: self.registry.clone(),
            key: key.clone(),
            id,
        };

        let is_mutation = request.is_mutation();
        if is_mutation {
            for record in &request.records {
                self.cache.resources().will_commit(record);
            }
        }

        self.policy.will_request(&request, key.as_ref());
        debug!(method = %request.method, url = %request.url, "issue request");

        let result = self
            .handler
            .request(request.clone())
            .await
            .and_then(check_response);

        let priority = guard.settle();
        self.policy
            .did_request(&request, result.as_ref().ok(), key.as_ref());

        if is_mutation {
            self.commit_mutation(&request, key.as_ref(), result)
        } else {
            self.commit_read(key.as_ref(), priority, result)
        }
    }

    fn commit_read(
        &self,
        key: Option<&RequestKey>,
        priority: Priority,
        result: Result<Response, FetchError>,
    ) -> Result<Document, RequestError> {
        let error = match result {
            Ok(response) => return Ok(self.cache.put(key, &response)?),
            Err(FetchError::Aborted) => return Err(RequestError::Aborted),
            Err(error) => error,
        };

        if let Some(key) = key {
            match priority {
                Priority::Blocking => {
                    let response = match &error {
                        FetchError::Server { status, .. } => Some(ResponseMeta {
                            status: *status,
                            ..Default::default()
                        }),
                        _ => None,
                    };
                    self.cache
                        .documents()
                        .put_error(key, error.clone(), response);
                }
                Priority::Background => {
                    // Callers were served already, the cached document stays as it is.
                    warn!(%key, %error, "background request failed");
                    self.cache.documents().invalidate(key);
                }
            }
        }

        Err(error.into())
    }

    fn commit_mutation(
        &self,
        request: &RequestInfo,
        key: Option<&RequestKey>,
        result: Result<Response, FetchError>,
    ) -> Result<Document, RequestError> {
        let resources = self.cache.resources();
        let response = match result {
            Ok(response) => response,
            Err(FetchError::Aborted) => {
                for record in &request.records {
                    resources.commit_was_aborted(record);
                }
                return Err(RequestError::Aborted);
            }
            Err(error) => {
                warn!(url = %request.url, %error, "mutation rejected");
                for record in &request.records {
                    resources.commit_was_rejected(record, error.api_errors().to_vec());
                }
                return Err(RequestError::MutationRejected(error));
            }
        };

        let Some(record) = request.records.first() else {
            return Ok(self.cache.put(key, &response)?);
        };

        let _batch = self.cache.join();

        if request.op == Some(RequestOp::DeleteRecord) {
            resources.did_commit(record, None);
            self.cache.unload(record);
            return Ok(Document {
                key: key.cloned(),
                ..Default::default()
            });
        }

        let primary = response
            .content
            .as_ref()
            .and_then(|document| document.data.as_ref())
            .and_then(|data| data.resources().next())
            .cloned();

        // Nothing new from the server, the resource already holds the saved values.
        let Some(mut primary) = primary.filter(|_| response.meta.status != 204) else {
            resources.did_commit(record, None);
            return Ok(Document {
                key: key.cloned(),
                data: Some(Content::One(Some(record.clone()))),
                ..Default::default()
            });
        };

        // Tie the response to the saved resource, servers don't have to echo the lid.
        if primary.lid.is_none() && primary.resource_type == record.resource_type() {
            primary.lid = Some(record.lid().to_owned());
        }
        let response = Response {
            content: Some(StructuredDocument {
                data: Some(PrimaryData::One(Some(primary.clone()))),
                ..response.content.unwrap_or_default()
            }),
            ..response
        };

        let document = match self.cache.put(key, &response) {
            Ok(document) => document,
            Err(err) => {
                resources.commit_was_rejected(record, Vec::new());
                return Err(err.into());
            }
        };

        // The record may have been merged into another identifier.
        let saved = match &document.data {
            Some(Content::One(Some(saved))) => saved.clone(),
            _ => record.clone(),
        };
        resources.did_commit(&saved, Some(&primary));
        debug!(%saved, "mutation committed");

        Ok(document)
    }
}

async fn wait(fetch: SharedFetch, signal: Option<CancellationToken>) -> Result<Document, RequestError> {
    let Some(signal) = signal else {
        return fetch.await;
    };

    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(RequestError::Aborted),
        result = fetch => result,
    }
}

fn serve(entry: DocumentEntry) -> Result<Document, RequestError> {
    if let Some(error) = entry.error {
        return Err(error.into());
    }
    Ok(Document::from(&entry))
}

/// Turns error statuses and error documents into failures.
fn check_response(response: Response) -> Result<Response, FetchError> {
    let is_error_document = response
        .content
        .as_ref()
        .is_some_and(StructuredDocument::is_error_document);

    if response.meta.status < 400 && !is_error_document {
        return Ok(response);
    }

    Err(FetchError::Server {
        status: response.meta.status,
        errors: response
            .content
            .map(|document| document.errors)
            .unwrap_or_default(),
    })
}
