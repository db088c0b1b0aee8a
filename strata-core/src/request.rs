// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::document::{ApiError, StructuredDocument};
use crate::identifier::ResourceKey;
use crate::serde::write_canonical;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store operation a request was built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestOp {
    FindRecord,
    FindAll,
    FindMany,
    Query,
    QueryRecord,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl RequestOp {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RequestOp::CreateRecord | RequestOp::UpdateRecord | RequestOp::DeleteRecord
        )
    }
}

/// Per-request cache behaviour.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Explicit cache key, replaces the computed request signature.
    pub key: Option<String>,

    /// Always perform a blocking fetch, even if a fresh cached document exists.
    pub reload: bool,

    /// Serve from cache (if possible) but refresh in the background.
    pub background_reload: bool,
}

/// Description of a request as passed into the handler chain.
#[derive(Clone, Debug, Default)]
pub struct RequestInfo {
    pub op: Option<RequestOp>,
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,

    /// Options which change the meaning of the request and therefore take part in the request
    /// signature (for example `include` or `fields`).
    pub options: BTreeMap<String, Value>,

    /// Transport headers, not part of the request signature.
    pub headers: BTreeMap<String, String>,

    pub cache_options: CacheOptions,

    /// Resources this request operates on, set for mutations.
    pub records: Vec<ResourceKey>,
}

impl RequestInfo {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn with_op(mut self, op: RequestOp) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_record(mut self, key: ResourceKey) -> Self {
        self.records.push(key);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_options.key = Some(key.into());
        self
    }

    pub fn reload(mut self) -> Self {
        self.cache_options.reload = true;
        self
    }

    pub fn background_reload(mut self) -> Self {
        self.cache_options.background_reload = true;
        self
    }

    pub fn is_mutation(&self) -> bool {
        match self.op {
            Some(op) => op.is_mutation(),
            None => self.method != Method::Get,
        }
    }

    /// Returns the cache key for this request or `None` if its result can't be cached.
    ///
    /// An explicit key from the cache options always wins. Otherwise reads get a key derived from
    /// the request signature, mutations and other non-`GET` requests without a read operation are
    /// uncacheable.
    pub fn request_key(&self) -> Option<RequestKey> {
        if let Some(key) = &self.cache_options.key {
            return Some(RequestKey::new(key.clone()));
        }

        let is_read = match self.op {
            Some(op) => !op.is_mutation(),
            None => self.method == Method::Get,
        };

        if !is_read || self.url.is_empty() {
            return None;
        }

        Some(RequestKey::from_signature(self))
    }
}

/// Identity of a cached document.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives a key from method, normalized url, body and signature-relevant options.
    ///
    /// Query parameter order and object key order don't affect the result.
    pub fn from_signature(request: &RequestInfo) -> Self {
        let signature = serde_json::json!({
            "method": request.method.as_str(),
            "url": normalize_url(&request.url),
            "body": request.body.clone().unwrap_or(Value::Null),
            "options": request.options,
        });

        let mut bytes = Vec::new();
        write_canonical(&signature, &mut bytes);
        Self(hex::encode(blake3::hash(&bytes).as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestKey").field(&self.0).finish()
    }
}

/// Sorts query parameters and drops empty segments and fragments.
fn normalize_url(url: &str) -> String {
    let url = url.split('#').next().unwrap_or_default();
    let Some((path, query)) = url.split_once('?') else {
        return url.to_owned();
    };

    let mut params: Vec<&str> = query.split('&').filter(|param| !param.is_empty()).collect();
    if params.is_empty() {
        return path.to_owned();
    }
    params.sort_unstable();
    format!("{}?{}", path, params.join("&"))
}

/// Transport level information about a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
        }
    }
}

/// Response handed back by the handler chain.
///
/// `content` is `None` for responses without a body, for example `204 No Content`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub meta: ResponseMeta,
    pub content: Option<StructuredDocument>,
}

impl Response {
    pub fn ok(document: StructuredDocument) -> Self {
        Self {
            meta: ResponseMeta::default(),
            content: Some(document),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.meta.status = status;
        self
    }

    pub fn no_content() -> Self {
        Self {
            meta: ResponseMeta {
                status: 204,
                headers: BTreeMap::new(),
            },
            content: None,
        }
    }
}

/// Failure reported by the handler chain.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("request was aborted")]
    Aborted,

    #[error("server responded with status {status}")]
    Server { status: u16, errors: Vec<ApiError> },
}

impl FetchError {
    /// Error objects the server sent along, if any.
    pub fn api_errors(&self) -> &[ApiError] {
        match self {
            FetchError::Server { errors, .. } => errors,
            _ => &[],
        }
    }
}
