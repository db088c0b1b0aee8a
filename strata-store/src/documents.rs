// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cached results of requests, keyed by `RequestKey`.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use strata_core::{FetchError, RequestKey, ResourceKey, ResponseMeta};
use tracing::trace;

use crate::notifications::{Bucket, NotificationManager, NotificationTarget};

/// Primary data of a document resolved to resource keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    One(Option<ResourceKey>),
    Many(Vec<ResourceKey>),
}

impl Content {
    pub fn keys(&self) -> &[ResourceKey] {
        match self {
            Content::One(Some(key)) => std::slice::from_ref(key),
            Content::One(None) => &[],
            Content::Many(keys) => keys,
        }
    }

    fn replace(&mut self, abandoned: &ResourceKey, kept: &ResourceKey) -> bool {
        match self {
            Content::One(Some(key)) if key == abandoned => {
                *key = kept.clone();
                true
            }
            Content::One(_) => false,
            Content::Many(keys) => {
                let mut changed = false;
                for key in keys.iter_mut().filter(|key| *key == abandoned) {
                    *key = kept.clone();
                    changed = true;
                }
                if changed {
                    // The survivor may have been listed already.
                    let mut seen = Vec::with_capacity(keys.len());
                    keys.retain(|key| {
                        if seen.contains(key) {
                            false
                        } else {
                            seen.push(key.clone());
                            true
                        }
                    });
                }
                changed
            }
        }
    }

    fn remove(&mut self, removed: &ResourceKey) -> bool {
        match self {
            Content::One(key) if key.as_ref() == Some(removed) => {
                *key = None;
                true
            }
            Content::One(_) => false,
            Content::Many(keys) => {
                let before = keys.len();
                keys.retain(|key| key != removed);
                before != keys.len()
            }
        }
    }
}

/// Everything known about the last fetch of a request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentEntry {
    pub key: Option<RequestKey>,
    pub content: Option<Content>,
    pub links: Option<Value>,
    pub meta: Option<Value>,
    pub response: ResponseMeta,

    /// Set when the last fetch failed. Content of earlier fetches is kept.
    pub error: Option<FetchError>,
}

/// Document handed back to the caller of a request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    pub key: Option<RequestKey>,
    pub data: Option<Content>,
    pub links: Option<Value>,
    pub meta: Option<Value>,
}

impl From<&DocumentEntry> for Document {
    fn from(entry: &DocumentEntry) -> Self {
        Self {
            key: entry.key.clone(),
            data: entry.content.clone(),
            links: entry.links.clone(),
            meta: entry.meta.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct DocumentCache {
    entries: Rc<RefCell<HashMap<RequestKey, DocumentEntry>>>,
    notifications: NotificationManager,
}

impl DocumentCache {
    pub fn new(notifications: NotificationManager) -> Self {
        Self {
            entries: Rc::default(),
            notifications,
        }
    }

    pub fn peek(&self, key: &RequestKey) -> Option<DocumentEntry> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<RequestKey> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Stores the result of a successful fetch, replacing the previous entry.
    ///
    /// Returns `false` and stays silent when nothing changed.
    pub fn put(&self, key: &RequestKey, mut entry: DocumentEntry) -> bool {
        entry.key = Some(key.clone());
        let bucket = {
            let mut entries = self.entries.borrow_mut();
            match entries.insert(key.clone(), entry.clone()) {
                Some(previous) if previous == entry => return false,
                Some(_) => Bucket::Updated,
                None => Bucket::Added,
            }
        };

        trace!(%key, ?bucket, "store document");
        self.notify(key, bucket);
        true
    }

    /// Stores a failed fetch. Content received earlier stays available.
    pub fn put_error(&self, key: &RequestKey, error: FetchError, response: Option<ResponseMeta>) {
        let bucket = {
            let mut entries = self.entries.borrow_mut();
            let bucket = if entries.contains_key(key) {
                Bucket::Updated
            } else {
                Bucket::Added
            };
            let entry = entries.entry(key.clone()).or_insert_with(|| DocumentEntry {
                key: Some(key.clone()),
                ..Default::default()
            });
            entry.error = Some(error);
            if let Some(response) = response {
                entry.response = response;
            }
            bucket
        };

        trace!(%key, "store failed request");
        self.notify(key, bucket);
    }

    pub fn remove(&self, key: &RequestKey) -> bool {
        let removed = self.entries.borrow_mut().remove(key).is_some();
        if removed {
            self.notify(key, Bucket::Removed);
        }
        removed
    }

    /// Tells subscribers that the document should be refetched.
    pub fn invalidate(&self, key: &RequestKey) {
        self.notify(key, Bucket::Invalidated);
    }

    /// Points every document referencing an abandoned identifier to its survivor.
    pub fn replace_resource(&self, abandoned: &ResourceKey, kept: &ResourceKey) {
        let changed: Vec<RequestKey> = self
            .entries
            .borrow_mut()
            .iter_mut()
            .filter_map(|(key, entry)| {
                let content = entry.content.as_mut()?;
                content.replace(abandoned, kept).then(|| key.clone())
            })
            .collect();

        for key in changed {
            self.notify(&key, Bucket::Updated);
        }
    }

    /// Drops an unloaded resource from every document.
    pub fn remove_resource(&self, removed: &ResourceKey) {
        let changed: Vec<RequestKey> = self
            .entries
            .borrow_mut()
            .iter_mut()
            .filter_map(|(key, entry)| {
                let content = entry.content.as_mut()?;
                content.remove(removed).then(|| key.clone())
            })
            .collect();

        for key in changed {
            self.notify(&key, Bucket::Updated);
        }
    }

    fn notify(&self, key: &RequestKey, bucket: Bucket) {
        self.notifications
            .notify(NotificationTarget::Document(key.clone()), bucket, None);
    }
}

#[cfg(test)]
mod tests {
    use strata_core::{FetchError, RequestKey, ResourceKey};

    use crate::notifications::{Bucket, NotificationManager};
    use crate::test_utils::RecordingSubscriber;

    use super::{Content, DocumentCache, DocumentEntry};

    fn entry(content: Content) -> DocumentEntry {
        DocumentEntry {
            content: Some(content),
            ..Default::default()
        }
    }

    #[test]
    fn put_and_replace() {
        let notifications = NotificationManager::new();
        let subscriber = RecordingSubscriber::all(&notifications);
        let documents = DocumentCache::new(notifications);

        let key = RequestKey::new("users");
        let user_1 = ResourceKey::new("user", Some("1".into()), "@lid:user-1");
        let user_2 = ResourceKey::new("user", Some("2".into()), "@lid:user-2");

        assert!(documents.put(&key, entry(Content::Many(vec![user_1.clone()]))));
        assert!(!documents.put(&key, entry(Content::Many(vec![user_1.clone()]))));
        assert!(documents.put(
            &key,
            entry(Content::Many(vec![user_1.clone(), user_2.clone()]))
        ));

        let buckets: Vec<Bucket> = subscriber.take().into_iter().map(|n| n.bucket).collect();
        assert_eq!(buckets, vec![Bucket::Added, Bucket::Updated]);

        // 1. Merge user 2 into user 1, duplicates collapse.
        documents.replace_resource(&user_2, &user_1);
        assert_eq!(
            documents.peek(&key).unwrap().content,
            Some(Content::Many(vec![user_1.clone()]))
        );

        // 2. Unload user 1.
        documents.remove_resource(&user_1);
        assert_eq!(
            documents.peek(&key).unwrap().content,
            Some(Content::Many(vec![]))
        );
        assert_eq!(subscriber.take().len(), 2);

        assert!(documents.remove(&key));
        assert!(!documents.contains(&key));
    }

    #[test]
    fn errors_keep_content() {
        let documents = DocumentCache::default();
        let key = RequestKey::new("user-1");
        let user = ResourceKey::new("user", Some("1".into()), "@lid:user-1");

        documents.put(&key, entry(Content::One(Some(user.clone()))));
        documents.put_error(&key, FetchError::Network("offline".into()), None);

        let stored = documents.peek(&key).unwrap();
        assert_eq!(stored.content, Some(Content::One(Some(user))));
        assert_eq!(stored.error, Some(FetchError::Network("offline".into())));
        assert_eq!(documents.keys(), vec![key]);
    }
}
