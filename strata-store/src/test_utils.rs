// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mocks and fixtures for testing code built on the store.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use strata_core::{FetchError, FieldSchema, MemorySchema, RequestInfo, RequestKey, Response};
use tokio::sync::watch;

use crate::notifications::{Notification, NotificationManager, NotificationTarget, SubscriptionId};
use crate::requests::{CachePolicy, Handler};

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Users with a symmetric `bestFriend`, `posts` with an explicit inverse and polymorphic `pets`
/// without one.
pub fn user_schema() -> MemorySchema {
    MemorySchema::new()
        .with_type(
            "user",
            [
                FieldSchema::attribute("name"),
                FieldSchema::belongs_to("bestFriend", "user").inverse("bestFriend"),
                FieldSchema::has_many("posts", "post").inverse("author"),
                FieldSchema::has_many("pets", "pet").polymorphic(),
            ],
        )
        .with_type(
            "post",
            [
                FieldSchema::attribute("title"),
                FieldSchema::belongs_to("author", "user").inverse("posts"),
            ],
        )
        .with_type("pet", [FieldSchema::attribute("name")])
        .with_type("dog", [FieldSchema::attribute("name")])
}

/// Collects every notification delivered to it. Unsubscribes when dropped.
pub struct RecordingSubscriber {
    manager: NotificationManager,
    id: SubscriptionId,
    received: Rc<RefCell<Vec<Notification>>>,
}

impl RecordingSubscriber {
    pub fn all(manager: &NotificationManager) -> Self {
        Self::subscribe(manager, None)
    }

    pub fn for_target(manager: &NotificationManager, target: NotificationTarget) -> Self {
        Self::subscribe(manager, Some(target))
    }

    fn subscribe(manager: &NotificationManager, target: Option<NotificationTarget>) -> Self {
        let received: Rc<RefCell<Vec<Notification>>> = Rc::default();
        let id = manager.subscribe(target, {
            let received = received.clone();
            move |notification| received.borrow_mut().push(notification.clone())
        });

        Self {
            manager: manager.clone(),
            id,
            received,
        }
    }

    /// Returns and clears everything received so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.received.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.received.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.borrow().is_empty()
    }
}

impl Drop for RecordingSubscriber {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.id);
    }
}

#[derive(Default)]
struct MockState {
    responses: HashMap<String, VecDeque<Result<Response, FetchError>>>,
    last: HashMap<String, Result<Response, FetchError>>,
    calls: Vec<RequestInfo>,
}

/// Handler answering with scripted responses per url.
///
/// Scripted responses are handed out in order, the last one is repeated once the queue ran dry.
/// While the gate is closed all requests stay pending.
#[derive(Clone)]
pub struct MockHandler {
    state: Rc<RefCell<MockState>>,
    gate: Rc<watch::Sender<bool>>,
}

impl Default for MockHandler {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Rc::default(),
            gate: Rc::new(gate),
        }
    }
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: Result<Response, FetchError>) -> &Self {
        self.state
            .borrow_mut()
            .responses
            .entry(url.to_owned())
            .or_default()
            .push_back(response);
        self
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<RequestInfo> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| call.url == url)
            .count()
    }

    fn next_response(&self, url: &str) -> Result<Response, FetchError> {
        let mut state = self.state.borrow_mut();
        let next = state
            .responses
            .get_mut(url)
            .and_then(|queue| queue.pop_front());

        match next {
            Some(response) => {
                state.last.insert(url.to_owned(), response.clone());
                response
            }
            None => state.last.get(url).cloned().unwrap_or_else(|| {
                Err(FetchError::Network(format!("no response scripted for {url}")))
            }),
        }
    }
}

impl Handler for MockHandler {
    async fn request(&self, request: RequestInfo) -> Result<Response, FetchError> {
        let url = request.url.clone();
        self.state.borrow_mut().calls.push(request);

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(FetchError::Aborted);
        }

        self.next_response(&url)
    }
}

#[derive(Default)]
struct TestPolicyState {
    hard_expired: HashSet<RequestKey>,
    soft_expired: HashSet<RequestKey>,
}

/// Cache policy where expiry is switched on and off by hand.
#[derive(Clone, Default)]
pub struct TestPolicy {
    state: Rc<RefCell<TestPolicyState>>,
}

impl TestPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hard_expired(&self, key: &RequestKey, expired: bool) {
        let mut state = self.state.borrow_mut();
        if expired {
            state.hard_expired.insert(key.clone());
        } else {
            state.hard_expired.remove(key);
        }
    }

    pub fn set_soft_expired(&self, key: &RequestKey, expired: bool) {
        let mut state = self.state.borrow_mut();
        if expired {
            state.soft_expired.insert(key.clone());
        } else {
            state.soft_expired.remove(key);
        }
    }
}

impl CachePolicy for TestPolicy {
    fn is_hard_expired(&self, key: &RequestKey) -> bool {
        self.state.borrow().hard_expired.contains(key)
    }

    fn is_soft_expired(&self, key: &RequestKey) -> bool {
        self.state.borrow().soft_expired.contains(key)
    }
}
