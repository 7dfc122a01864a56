#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! Single-flight request coalescing, `Cache-Control`-aware response reuse,
//! and per-origin throttling for outbound HTTP fetches.
//!
//! [`Coordinator`] is the usual entry point: it owns one [`Target`] per
//! origin (`host:port`) and forwards calls to it. Each Target coalesces
//! concurrent requests for the same location so a struggling origin is
//! hit once instead of once per caller, serves cached bodies while their
//! cache rules remain valid, and evicts least-recently-used entries once
//! the origin (or the process as a whole) exceeds its storage budget.
//!
//! The actual HTTP transport is out of scope: callers supply a
//! [`Fetcher`] implementation wrapping whatever client they already use.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flightcache::{Coordinator, CoordinatorOptions, Fetcher, RequestInit};
//!
//! # async fn run(fetcher: Arc<dyn Fetcher>) -> flightcache::Result<()> {
//! let coordinator = Coordinator::new(CoordinatorOptions { fetcher, ..Default::default() });
//! let url = url::Url::parse("https://example.com/thing")?;
//! let response = coordinator.fetch(&url, &RequestInit::default()).await?;
//! let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod cache_rules;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod eviction_map;
pub mod fetcher;
pub mod location;
pub mod target;
pub mod throttle;

pub use cache_rules::{extract_cache_rules, CacheRuleParameters};
pub use clock::{Bytes, Clock, Duration, Instant, ManualClock, SystemClock};
pub use coordinator::{default_coordinator, init_default, Coordinator, CoordinatorOptions};
pub use error::{CacheError, Result};
pub use eviction_map::EvictionMap;
pub use fetcher::{Fetcher, RawResponse, RequestInit, UnconfiguredFetcher};
pub use location::LocationStatus;
pub use target::Target;
pub use throttle::{NoopThrottle, SemaphoreThrottle, Throttle};

#[cfg(feature = "rate-limiting")]
pub use throttle::GovernorThrottle;
