//! The per-location cache state machine.

use std::sync::Arc;

use futures::{channel::oneshot, future::Shared};
use http::{HeaderMap, StatusCode};

use crate::{
    cache_rules::CacheRuleParameters,
    clock::{Bytes, Instant},
};

/// A cloneable completion signal every coalesced caller awaits.
///
/// Resolves whether the sender actually sent (request settled) or was
/// dropped without sending (the installing caller panicked mid-fetch) —
/// waiters treat both the same way: re-check `known[loc]`.
pub type UnblockSignal = Shared<oneshot::Receiver<()>>;

/// The cache status of a single `(pathname, query)` location within a
/// [`crate::target::Target`].
#[derive(Debug, Clone)]
pub enum LocationStatus {
    /// A first request for this location is in flight; cacheability is not
    /// yet known.
    Unknown {
        /// Signal other callers await until the in-flight request settles.
        unblock: UnblockSignal,
    },
    /// The origin forbade caching this location (`Cache-Control: no-store`).
    NoStore,
    /// A fully buffered response, reusable until `rules` says otherwise.
    Cached {
        /// The buffered response body.
        body: Arc<Vec<u8>>,
        /// The response status code.
        status: StatusCode,
        /// The response headers.
        headers: HeaderMap,
        /// Parsed cache-control parameters governing reuse.
        rules: CacheRuleParameters,
        /// When this entry was last served, for LRU eviction.
        last_used: Instant,
    },
    /// The last attempt returned a server error (status >= 500).
    Fail,
}

impl LocationStatus {
    /// When this entry was last consulted. `Unknown`/`NoStore`/`Fail` have
    /// no meaningful recency of their own, so they report `now` — they
    /// carry zero or infinite weight in `gc` regardless, so their sort
    /// position never actually matters.
    pub fn last_used(&self, now: Instant) -> Instant {
        match self {
            LocationStatus::Cached { last_used, .. } => *last_used,
            _ => now,
        }
    }

    /// The buffered body size, or zero for non-`Cached` variants.
    pub fn size(&self) -> Bytes {
        match self {
            LocationStatus::Cached { body, .. } => Bytes::new(body.len() as u64),
            _ => Bytes::ZERO,
        }
    }

    /// Whether this entry may still be served. `Unknown` and `NoStore`
    /// count as valid (there is no stale body to reject); `Fail` never
    /// does, which is what makes it always evict first under `gc`.
    pub fn valid(&self, now: Instant) -> bool {
        match self {
            LocationStatus::Unknown { .. } | LocationStatus::NoStore => true,
            LocationStatus::Cached { rules, .. } => rules.valid_at(now),
            LocationStatus::Fail => false,
        }
    }
}
