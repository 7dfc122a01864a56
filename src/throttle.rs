//! The out-of-scope per-origin concurrency throttle.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{error::Result, fetcher::RawResponse};

/// A boxed, already-started fetch future, handed to a [`Throttle`] to run
/// under whatever concurrency or pacing policy it enforces.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<RawResponse>> + Send + 'a>>;

/// Bounds concurrency (or paces requests) for fetches against one Target.
#[async_trait]
pub trait Throttle: Send + Sync + std::fmt::Debug {
    /// Run `fetch` under whatever pacing or concurrency limit this throttle
    /// enforces.
    async fn run<'a>(&'a self, fetch: FetchFuture<'a>) -> Result<RawResponse>;
}

/// A `Throttle` that imposes no limit at all, for tests and for callers
/// that throttle elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThrottle;

#[async_trait]
impl Throttle for NoopThrottle {
    async fn run<'a>(&'a self, fetch: FetchFuture<'a>) -> Result<RawResponse> {
        fetch.await
    }
}

/// The practical default: bounds the number of fetches in flight against a
/// single Target at once.
#[derive(Debug)]
pub struct SemaphoreThrottle {
    semaphore: Arc<Semaphore>,
}

impl SemaphoreThrottle {
    /// Allow up to `max_concurrent` fetches in flight at a time.
    pub fn new(max_concurrent: usize) -> Self {
        SemaphoreThrottle { semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }
}

#[async_trait]
impl Throttle for SemaphoreThrottle {
    async fn run<'a>(&'a self, fetch: FetchFuture<'a>) -> Result<RawResponse> {
        let _permit =
            self.semaphore.acquire().await.expect("SemaphoreThrottle semaphore is never closed");
        fetch.await
    }
}

#[cfg(feature = "rate-limiting")]
mod governor_throttle {
    use std::num::NonZeroU32;

    use governor::{DefaultDirectRateLimiter, Quota};

    use super::*;

    /// A token-bucket-paced [`Throttle`], for origins that need smooth
    /// request spacing rather than a hard concurrency ceiling.
    #[derive(Debug)]
    pub struct GovernorThrottle {
        limiter: DefaultDirectRateLimiter,
    }

    impl GovernorThrottle {
        /// Allow up to `requests_per_second` fetches per second against a
        /// single Target.
        pub fn new(requests_per_second: NonZeroU32) -> Self {
            GovernorThrottle {
                limiter: DefaultDirectRateLimiter::direct(Quota::per_second(requests_per_second)),
            }
        }
    }

    #[async_trait]
    impl Throttle for GovernorThrottle {
        async fn run<'a>(&'a self, fetch: FetchFuture<'a>) -> Result<RawResponse> {
            self.limiter.until_ready().await;
            fetch.await
        }
    }
}

#[cfg(feature = "rate-limiting")]
pub use governor_throttle::GovernorThrottle;
