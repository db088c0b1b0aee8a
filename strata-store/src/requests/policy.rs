// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use strata_core::{RequestInfo, RequestKey, RequestOp, Response};
use tokio::time::Instant;
use tracing::debug;

/// Decides whether a cached document can still be served.
pub trait CachePolicy {
    /// Document must not be served anymore, the caller waits for a fresh fetch.
    fn is_hard_expired(&self, key: &RequestKey) -> bool;

    /// Document can be served but should be refreshed in the background.
    fn is_soft_expired(&self, key: &RequestKey) -> bool;

    /// Called before a request is handed to the handler chain.
    fn will_request(&self, _request: &RequestInfo, _key: Option<&RequestKey>) {}

    /// Called after a request settled, `response` is `None` if it failed.
    fn did_request(
        &self,
        _request: &RequestInfo,
        _response: Option<&Response>,
        _key: Option<&RequestKey>,
    ) {
    }

    /// Called after the document of a request was removed from the cache.
    fn did_remove(&self, _key: &RequestKey) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    pub hard_expires: Duration,
    pub soft_expires: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hard_expires: Duration::from_secs(5 * 60),
            soft_expires: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    fetched_at: HashMap<RequestKey, Instant>,
    invalidated: HashSet<RequestKey>,
    stale: HashSet<RequestKey>,

    /// Requests whose response contained resources of a type.
    types: HashMap<String, HashSet<RequestKey>>,
}

/// Time based policy.
///
/// Documents expire relative to their last successful fetch. Keys without a recorded fetch (for
/// example documents pushed manually) never expire unless invalidated.
#[derive(Clone, Debug, Default)]
pub struct DefaultCachePolicy {
    config: PolicyConfig,
    state: Rc<RefCell<PolicyState>>,
}

impl DefaultCachePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            state: Rc::default(),
        }
    }

    /// Forces a blocking fetch on the next request.
    pub fn invalidate(&self, key: &RequestKey) {
        self.state.borrow_mut().invalidated.insert(key.clone());
    }

    /// Forces a background refresh on the next request.
    pub fn mark_stale(&self, key: &RequestKey) {
        self.state.borrow_mut().stale.insert(key.clone());
    }

    /// Invalidates every request whose response contained resources of the given type.
    pub fn invalidate_requests_for_type(&self, resource_type: &str) -> Vec<RequestKey> {
        let mut state = self.state.borrow_mut();
        let keys: Vec<RequestKey> = state
            .types
            .get(resource_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        state.invalidated.extend(keys.iter().cloned());

        if !keys.is_empty() {
            debug!(resource_type, requests = keys.len(), "invalidate requests for type");
        }
        keys
    }

    fn forget(state: &mut PolicyState, key: &RequestKey) {
        state.fetched_at.remove(key);
        state.invalidated.remove(key);
        state.stale.remove(key);
        state.types.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    fn is_older_than(&self, key: &RequestKey, duration: Duration) -> bool {
        self.state
            .borrow()
            .fetched_at
            .get(key)
            .is_some_and(|fetched_at| fetched_at.elapsed() >= duration)
    }
}

impl CachePolicy for DefaultCachePolicy {
    fn is_hard_expired(&self, key: &RequestKey) -> bool {
        self.state.borrow().invalidated.contains(key)
            || self.is_older_than(key, self.config.hard_expires)
    }

    fn is_soft_expired(&self, key: &RequestKey) -> bool {
        self.state.borrow().stale.contains(key) || self.is_older_than(key, self.config.soft_expires)
    }

    fn did_request(
        &self,
        request: &RequestInfo,
        response: Option<&Response>,
        key: Option<&RequestKey>,
    ) {
        let Some(response) = response else {
            return;
        };

        if let Some(key) = key {
            let mut state = self.state.borrow_mut();
            // Types are indexed from the latest response only.
            Self::forget(&mut state, key);
            state.fetched_at.insert(key.clone(), Instant::now());

            for resource in response.content.iter().flat_map(|document| document.resources()) {
                state
                    .types
                    .entry(resource.resource_type.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        if request.op == Some(RequestOp::CreateRecord) {
            let created: HashSet<&str> = request
                .records
                .iter()
                .map(|record| record.resource_type())
                .collect();
            for resource_type in created {
                self.invalidate_requests_for_type(resource_type);
            }
        }
    }

    fn did_remove(&self, key: &RequestKey) {
        Self::forget(&mut self.state.borrow_mut(), key);
    }
}
