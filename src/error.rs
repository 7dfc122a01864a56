//! The crate's error taxonomy.

use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// A generic error for the cache coordinator and its collaborators.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The fetcher returned an error for an outbound request.
    #[error("fetch failed: {0}")]
    Fetch(Box<dyn std::error::Error + Send + Sync>),
    /// An async weigher used by [`crate::eviction_map::EvictionMap::gc`] failed.
    #[error("weigher failed during gc: {0}")]
    Weigher(Box<dyn std::error::Error + Send + Sync>),
    /// The request URL has no host, so a target key cannot be derived.
    #[error("url has no host: {0}")]
    NoHost(String),
    /// There was an error parsing the URL.
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    /// There was an error converting a header value to a string.
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error constructing an HTTP header value.
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error constructing an HTTP header name.
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// The default process-wide [`crate::coordinator::Coordinator`] was used
    /// without ever being initialized with a real fetcher.
    #[error(
        "no fetcher configured: call `init_default` before using the default coordinator"
    )]
    NoFetcherConfigured,
    /// The default process-wide coordinator was initialized more than once.
    #[error("default coordinator already initialized")]
    AlreadyInitialized,
}
