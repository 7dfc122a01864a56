//! The out-of-scope HTTP transport seam.
//!
//! The coordinator never issues HTTP requests itself; it calls out to
//! whatever [`Fetcher`] the embedding application supplies.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{CacheError, Result};

/// Per-call parameters carried alongside the URL. The request body is
/// outside the cache's area of interest and is not represented here —
/// implementations that need one should close over it themselves.
#[derive(Debug, Clone)]
pub struct RequestInit {
    /// The HTTP method to use. Defaults to `GET`.
    pub method: Method,
    /// Extra headers to send with the request.
    pub headers: HeaderMap,
}

impl Default for RequestInit {
    fn default() -> Self {
        RequestInit { method: Method::GET, headers: HeaderMap::new() }
    }
}

/// A fully buffered response as returned by a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The response status code.
    pub status: StatusCode,
    /// The response headers, as received from the origin.
    pub headers: HeaderMap,
    /// The fully buffered response body.
    pub body: Vec<u8>,
}

/// The underlying HTTP fetch primitive. Implementations are free to wrap
/// any HTTP client; the cache only ever sees this trait.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Issue a single request and return its fully buffered response.
    async fn fetch(&self, url: &Url, init: &RequestInit) -> Result<RawResponse>;
}

/// The placeholder fetcher behind the default process-wide coordinator,
/// before an application calls `init_default` with a real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredFetcher;

#[async_trait]
impl Fetcher for UnconfiguredFetcher {
    async fn fetch(&self, _url: &Url, _init: &RequestInit) -> Result<RawResponse> {
        Err(CacheError::NoFetcherConfigured)
    }
}
