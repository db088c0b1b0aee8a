// SPDX-License-Identifier: MIT OR Apache-2.0

use std::rc::Rc;

use strata_core::SchemaService;

use crate::cache::Cache;
use crate::identifiers::{IdentifierCache, IdentifierConfig};
use crate::requests::{CachePolicy, DefaultCachePolicy, Handler, PolicyConfig, RequestCoordinator};
use crate::store::Store;

pub struct StoreBuilder<H, P = DefaultCachePolicy> {
    schema: Rc<dyn SchemaService>,
    handler: H,
    policy: P,
    identifiers: IdentifierConfig,
}

impl<H> StoreBuilder<H>
where
    H: Handler + 'static,
{
    pub fn new(schema: impl SchemaService + 'static, handler: H) -> Self {
        StoreBuilder {
            schema: Rc::new(schema),
            handler,
            policy: DefaultCachePolicy::default(),
            identifiers: IdentifierConfig::default(),
        }
    }

    /// Expiry durations of the default cache policy.
    pub fn expiry(mut self, config: PolicyConfig) -> Self {
        self.policy = DefaultCachePolicy::new(config);
        self
    }
}

impl<H, P> StoreBuilder<H, P>
where
    H: Handler + 'static,
    P: CachePolicy + 'static,
{
    pub fn policy<Q>(self, policy: Q) -> StoreBuilder<H, Q>
    where
        Q: CachePolicy + 'static,
    {
        StoreBuilder {
            schema: self.schema,
            handler: self.handler,
            policy,
            identifiers: self.identifiers,
        }
    }

    pub fn identifier_config(mut self, config: IdentifierConfig) -> Self {
        self.identifiers = config;
        self
    }

    pub fn build(self) -> Store<H, P> {
        let cache = Cache::new(IdentifierCache::new(self.identifiers), self.schema);
        let coordinator = RequestCoordinator::new(cache.clone(), self.handler, self.policy);
        Store::from_parts(cache, coordinator)
    }
}
