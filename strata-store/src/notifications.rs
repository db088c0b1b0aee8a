// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use indexmap::IndexSet;
use strata_core::{RequestKey, ResourceKey};
use tracing::trace;

/// What a notification is about: a single resource or a cached document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NotificationTarget {
    Resource(ResourceKey),
    Document(RequestKey),
}

/// Kind of change a notification reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Identifier got an id assigned or was merged.
    Identity,
    Attributes,
    Relationships,
    /// Lifecycle state changed, for example a save was accepted or rejected.
    State,
    Added,
    Removed,
    Updated,
    Invalidated,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Notification {
    pub target: NotificationTarget,
    pub bucket: Bucket,

    /// Field name for `attributes` and `relationships` changes.
    pub key: Option<String>,
}

pub type SubscriptionId = u64;

type Callback = Rc<dyn Fn(&Notification)>;

struct Subscriber {
    target: Option<NotificationTarget>,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_subscription_id: SubscriptionId,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    depth: usize,
    queue: IndexSet<Notification>,
}

/// Delivers change notifications to subscribers.
///
/// While a batch is open notifications are queued and coalesced: the same `(target, bucket, key)`
/// triple is delivered at most once, in the order it was first raised, when the outermost batch
/// closes.
#[derive(Clone, Default)]
pub struct NotificationManager {
    inner: Rc<RefCell<Inner>>,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for notifications on `target` or, when `None`, for all of them.
    pub fn subscribe(
        &self,
        target: Option<NotificationTarget>,
        callback: impl Fn(&Notification) + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                target,
                callback: Rc::new(callback),
            },
        );
        id
    }

    /// Returns `true` if a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.borrow_mut().subscribers.remove(&id).is_some()
    }

    /// Raises a notification. Returns `false` if it was coalesced with an already queued one.
    pub fn notify(&self, target: NotificationTarget, bucket: Bucket, key: Option<&str>) -> bool {
        let notification = Notification {
            target,
            bucket,
            key: key.map(ToOwned::to_owned),
        };

        {
            let mut inner = self.inner.borrow_mut();
            if inner.depth > 0 {
                return inner.queue.insert(notification);
            }
        }

        self.deliver(vec![notification]);
        true
    }

    /// Opens a batch. Notifications are held back until the last open batch is dropped.
    pub fn batch(&self) -> NotificationBatch {
        self.inner.borrow_mut().depth += 1;
        NotificationBatch {
            manager: self.clone(),
        }
    }

    pub fn is_batching(&self) -> bool {
        self.inner.borrow().depth > 0
    }

    fn deliver(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            // Subscribers may subscribe, unsubscribe or raise new notifications from within their
            // callback, so we never hold the borrow while calling them.
            let callbacks: Vec<Callback> = {
                let inner = self.inner.borrow();
                inner
                    .subscribers
                    .values()
                    .filter(|subscriber| match &subscriber.target {
                        Some(target) => target == &notification.target,
                        None => true,
                    })
                    .map(|subscriber| subscriber.callback.clone())
                    .collect()
            };

            trace!(
                target = ?notification.target,
                bucket = ?notification.bucket,
                key = ?notification.key,
                subscribers = callbacks.len(),
                "deliver notification"
            );

            for callback in callbacks {
                callback(&notification);
            }
        }
    }
}

/// Scope of coalesced notifications, see `NotificationManager::batch`.
pub struct NotificationBatch {
    manager: NotificationManager,
}

impl Drop for NotificationBatch {
    fn drop(&mut self) {
        let queued = {
            let mut inner = self.manager.inner.borrow_mut();
            inner.depth -= 1;
            if inner.depth > 0 {
                return;
            }
            mem::take(&mut inner.queue)
        };

        self.manager.deliver(queued.into_iter().collect());
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use strata_core::{RequestKey, ResourceKey};

    use super::{Bucket, NotificationManager, NotificationTarget};

    #[test]
    fn filtered_subscriptions() {
        let manager = NotificationManager::new();
        let key = ResourceKey::new("user", Some("1".into()), "@lid:user-1");
        let received = Rc::new(RefCell::new(Vec::new()));

        let id = {
            let received = received.clone();
            manager.subscribe(Some(NotificationTarget::Resource(key.clone())), move |n| {
                received.borrow_mut().push(n.clone())
            })
        };

        manager.notify(
            NotificationTarget::Resource(key.clone()),
            Bucket::Attributes,
            Some("name"),
        );
        manager.notify(
            NotificationTarget::Document(RequestKey::new("users")),
            Bucket::Updated,
            None,
        );
        assert_eq!(received.borrow().len(), 1);
        assert_eq!(received.borrow()[0].key.as_deref(), Some("name"));

        assert!(manager.unsubscribe(id));
        manager.notify(NotificationTarget::Resource(key), Bucket::State, None);
        assert_eq!(received.borrow().len(), 1);
    }

    #[test]
    fn batches_coalesce_and_defer() {
        let manager = NotificationManager::new();
        let key = ResourceKey::new("user", Some("1".into()), "@lid:user-1");
        let received = Rc::new(RefCell::new(Vec::new()));

        {
            let received = received.clone();
            manager.subscribe(None, move |n| received.borrow_mut().push(n.bucket));
        }

        {
            let _outer = manager.batch();
            {
                let _inner = manager.batch();
                let target = NotificationTarget::Resource(key.clone());
                assert!(manager.notify(target.clone(), Bucket::Relationships, Some("bestFriend")));
                assert!(!manager.notify(target.clone(), Bucket::Relationships, Some("bestFriend")));
                assert!(manager.notify(target, Bucket::Attributes, Some("name")));
            }

            // Inner batch closed, but outer one is still open.
            assert!(received.borrow().is_empty());
        }

        assert_eq!(
            *received.borrow(),
            vec![Bucket::Relationships, Bucket::Attributes]
        );
    }
}
