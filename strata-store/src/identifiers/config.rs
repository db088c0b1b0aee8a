// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::rc::Rc;

use strata_core::{ResourceIdentifier, ResourceKey};

/// Produces the `lid` for a resource seen for the first time.
pub type GenerateFn = dyn Fn(&ResourceIdentifier) -> String;

/// Picks the surviving identifier when two keys turn out to name the same resource.
///
/// Arguments are the key being updated (`target`), the already existing key it collides with
/// (`matched`) and the incoming data. Must return one of the two keys.
pub type MergeFn = dyn Fn(&ResourceKey, &ResourceKey, &ResourceIdentifier) -> ResourceKey;

/// Observes an identifier which got an id assigned or survived a merge.
pub type UpdateFn = dyn Fn(&ResourceKey);

/// Observes an identifier which was forgotten or abandoned by a merge.
pub type ForgetFn = dyn Fn(&ResourceKey);

/// Pluggable hooks of the identifier cache.
#[derive(Clone)]
pub struct IdentifierConfig {
    pub(crate) generate: Rc<GenerateFn>,
    pub(crate) merge: Rc<MergeFn>,
    pub(crate) update: Option<Rc<UpdateFn>>,
    pub(crate) forget: Option<Rc<ForgetFn>>,
}

impl IdentifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(mut self, hook: impl Fn(&ResourceIdentifier) -> String + 'static) -> Self {
        self.generate = Rc::new(hook);
        self
    }

    pub fn merge(
        mut self,
        hook: impl Fn(&ResourceKey, &ResourceKey, &ResourceIdentifier) -> ResourceKey + 'static,
    ) -> Self {
        self.merge = Rc::new(hook);
        self
    }

    pub fn on_update(mut self, hook: impl Fn(&ResourceKey) + 'static) -> Self {
        self.update = Some(Rc::new(hook));
        self
    }

    pub fn on_forget(mut self, hook: impl Fn(&ResourceKey) + 'static) -> Self {
        self.forget = Some(Rc::new(hook));
        self
    }
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            generate: Rc::new(default_generate),
            merge: Rc::new(default_merge),
            update: None,
            forget: None,
        }
    }
}

impl fmt::Debug for IdentifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierConfig")
            .field("update", &self.update.is_some())
            .field("forget", &self.forget.is_some())
            .finish_non_exhaustive()
    }
}

/// Derives the lid from type and id. Client-only resources get a random token.
pub fn default_generate(identifier: &ResourceIdentifier) -> String {
    match &identifier.id {
        Some(id) => format!("@lid:{}-{}", identifier.resource_type, id),
        None => {
            let token: [u8; 16] = rand::random();
            format!("@lid:{}-{}", identifier.resource_type, hex::encode(token))
        }
    }
}

/// Keeps the identifier which already has an id, prefers the existing one otherwise.
pub fn default_merge(
    target: &ResourceKey,
    matched: &ResourceKey,
    _data: &ResourceIdentifier,
) -> ResourceKey {
    if target.id().is_some() && matched.id().is_none() {
        target.clone()
    } else {
        matched.clone()
    }
}
