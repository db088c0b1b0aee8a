// SPDX-License-Identifier: MIT OR Apache-2.0

use strata_core::{FetchError, RequestInfo, Response};

/// Next step of the handler chain, performing the actual transport work.
///
/// The coordinator never does I/O itself, it hands every request it can't answer from cache on to
/// a handler. Implementations are free to forward to further handlers.
pub trait Handler {
    fn request(&self, request: RequestInfo) -> impl Future<Output = Result<Response, FetchError>>;
}

/// Handler implemented by an async function or closure.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(RequestInfo) -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
{
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestInfo) -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
{
    fn request(&self, request: RequestInfo) -> impl Future<Output = Result<Response, FetchError>> {
        (self.0)(request)
    }
}
