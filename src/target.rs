//! Per-origin request coalescing, cache lookup, and eviction scheduling.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt, Shared},
};
use http::HeaderValue;
use tokio::sync::Mutex;
use url::Url;

use crate::{
    cache_rules::extract_cache_rules,
    clock::{Bytes, Clock, Instant},
    error::Result,
    eviction_map::EvictionMap,
    fetcher::{Fetcher, RawResponse, RequestInit},
    location::{LocationStatus, UnblockSignal},
    throttle::Throttle,
};

const STATUS_HEADER: &str = "snarfetch-status";

fn location_key(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

type GcFuture = Shared<BoxFuture<'static, Bytes>>;

/// The controller for a single origin (`host:port`).
///
/// Owns the location map, the throttled fetcher, and the single-flight
/// slot that coalesces both concurrent fetches and concurrent GC passes.
pub struct Target {
    known: Mutex<EvictionMap<String, LocationStatus>>,
    fetcher: Arc<dyn Fetcher>,
    throttle: Arc<dyn Throttle>,
    clock: Arc<dyn Clock>,
    limit_bytes: AtomicI64,
    gc_slot: Mutex<Option<GcFuture>>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("limit_bytes", &self.limit_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Target {
    /// Build a Target with an empty location map and the given storage
    /// limit.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        throttle: Arc<dyn Throttle>,
        clock: Arc<dyn Clock>,
        limit: Bytes,
    ) -> Arc<Self> {
        Arc::new(Target {
            known: Mutex::new(EvictionMap::new()),
            fetcher,
            throttle,
            clock,
            limit_bytes: AtomicI64::new(limit.as_u64() as i64),
            gc_slot: Mutex::new(None),
        })
    }

    /// Fetch `url`, coalescing with any identical in-flight request and
    /// serving a cached body when one is still valid.
    pub async fn fetch(self: &Arc<Self>, url: &Url, init: &RequestInit) -> Result<RawResponse> {
        let loc = location_key(url);
        let t0 = self.clock.now();

        let status = loop {
            let unblock = {
                let known = self.known.lock().await;
                match known.get(&loc) {
                    Some(LocationStatus::Unknown { unblock }) => Some(unblock.clone()),
                    other => break other.cloned(),
                }
            };
            if let Some(unblock) = unblock {
                let _ = unblock.await;
            }
        };

        if let Some(LocationStatus::Cached { body, status: code, headers, rules, .. }) = &status {
            if rules.valid_at(t0) {
                let now = self.clock.now();
                let mut headers = headers.clone();
                let age_secs = rules.age_base.since(now).as_secs_ceil();
                headers.insert("age", HeaderValue::from_str(&age_secs.to_string())?);
                let elapsed = t0.since(now).as_millis();
                headers.insert(
                    STATUS_HEADER,
                    HeaderValue::from_str(&format!("HIT in {elapsed} ms"))?,
                );
                self.touch(&loc, now).await;
                log::debug!("{loc}: HIT in {elapsed} ms");
                return Ok(RawResponse { status: *code, headers, body: body.as_ref().clone() });
            }
        }

        // Only a missing or invalidated-Cached entry gets a coalescing
        // gate; NoStore and Fail callers each issue their own fetch.
        let install_gate = matches!(status, None | Some(LocationStatus::Cached { .. }));
        let tx = if install_gate {
            let (tx, rx) = oneshot::channel();
            let unblock: UnblockSignal = rx.shared();
            let mut known = self.known.lock().await;
            known.insert(loc.clone(), LocationStatus::Unknown { unblock });
            Some(tx)
        } else {
            None
        };

        let fetch_fut: crate::throttle::FetchFuture<'_> = Box::pin(self.fetcher.fetch(url, init));
        let result = self.throttle.run(fetch_fut).await;
        let now = self.clock.now();
        let elapsed = t0.since(now).as_millis();

        match result {
            Err(err) => {
                if install_gate {
                    let mut known = self.known.lock().await;
                    known.remove(&loc);
                }
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                log::warn!("{loc}: fetch failed after {elapsed} ms: {err}");
                Err(err)
            }
            Ok(mut resp) => {
                if resp.status.as_u16() >= 500 {
                    {
                        let mut known = self.known.lock().await;
                        known.insert(loc.clone(), LocationStatus::Fail);
                    }
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    log::debug!("{loc}: FAIL status {} in {elapsed} ms", resp.status);
                    return Ok(resp);
                }

                let rules = extract_cache_rules(&resp.headers, self.clock.as_ref());
                if rules.no_store {
                    {
                        let mut known = self.known.lock().await;
                        known.insert(loc.clone(), LocationStatus::NoStore);
                    }
                    if let Some(tx) = tx {
                        let _ = tx.send(());
                    }
                    resp.headers.insert(
                        STATUS_HEADER,
                        HeaderValue::from_str(&format!("NOSTORE in {elapsed} ms"))?,
                    );
                    log::debug!("{loc}: NOSTORE in {elapsed} ms");
                    return Ok(resp);
                }

                let body = Arc::new(resp.body.clone());
                {
                    let mut known = self.known.lock().await;
                    known.insert(
                        loc.clone(),
                        LocationStatus::Cached {
                            body,
                            status: resp.status,
                            headers: resp.headers.clone(),
                            rules,
                            last_used: now,
                        },
                    );
                }
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                resp.headers.insert(
                    STATUS_HEADER,
                    HeaderValue::from_str(&format!("MISS in {elapsed} ms"))?,
                );
                log::debug!("{loc}: MISS in {elapsed} ms");
                self.schedule_gc();
                Ok(resp)
            }
        }
    }

    async fn touch(&self, loc: &str, now: Instant) {
        let mut known = self.known.lock().await;
        if let Some(LocationStatus::Cached { last_used, .. }) = known.get_mut(&loc.to_string()) {
            *last_used = now;
        }
    }

    /// Reset this Target's storage limit to `limit` and run a GC pass
    /// against it, sharing the single-flight slot with any pass already
    /// in progress. Returns the post-pass total weight.
    pub async fn gc(self: &Arc<Self>, limit: Bytes) -> Bytes {
        self.limit_bytes.store(limit.as_u64() as i64, Ordering::SeqCst);
        self.run_gc_coalesced().await
    }

    fn schedule_gc(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_gc_coalesced().await;
        });
    }

    async fn run_gc_coalesced(self: &Arc<Self>) -> Bytes {
        let fut = {
            let mut slot = self.gc_slot.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let this = Arc::clone(self);
                    let fut: GcFuture = async move { this.run_gc_once().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        let weight = fut.await;
        let mut slot = self.gc_slot.lock().await;
        *slot = None;
        weight
    }

    async fn run_gc_once(&self) -> Bytes {
        let now = self.clock.now();
        let limit = Bytes::new(self.limit_bytes.load(Ordering::SeqCst) as u64);
        let mut known = self.known.lock().await;

        let current = known
            .weight(|v| {
                let size = v.size();
                async move { Ok(size) }
            })
            .await
            .expect("the size weigher never fails");

        if current <= limit {
            return current;
        }

        let kept = known
            .gc(
                limit,
                |v| v.last_used(now),
                |v| {
                    let weight = if v.valid(now) { v.size() } else { Bytes::INFINITE };
                    async move { Ok(weight) }
                },
                |a: &Instant, b: &Instant| a.cmp(b),
            )
            .await
            .expect("the size weigher never fails");
        log::debug!("gc: {current} -> {kept} (limit {limit})");
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct ScriptedFetcher {
        bodies: Mutex<Vec<(StatusCode, Vec<(&'static str, &'static str)>, &'static [u8])>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &Url, _init: &RequestInit) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bodies = self.bodies.lock().await;
            let (status, headers, body) = bodies.remove(0);
            let mut map = HeaderMap::new();
            for (k, v) in headers {
                map.insert(k, HeaderValue::from_static(v));
            }
            Ok(RawResponse { status, headers: map, body: body.to_vec() })
        }
    }

    fn target(fetcher: ScriptedFetcher, clock: Arc<ManualClock>) -> Arc<Target> {
        Target::new(
            Arc::new(fetcher),
            Arc::new(crate::throttle::NoopThrottle),
            clock,
            Bytes::mib(50),
        )
    }

    fn url() -> Url {
        Url::parse("http://example.test/thing").unwrap()
    }

    #[tokio::test]
    async fn s2_dedup_before_known() {
        let clock = Arc::new(ManualClock::new());
        let t = target(
            ScriptedFetcher {
                bodies: Mutex::new(vec![
                    (StatusCode::OK, vec![], b"1"),
                    (StatusCode::OK, vec![], b"2"),
                ]),
                calls: AtomicUsize::new(0),
            },
            clock,
        );
        let first = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(first.body, b"1");
        assert!(first.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("MISS"));

        let second = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(second.body, b"1");
        assert!(second.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("HIT"));
    }

    #[tokio::test]
    async fn s3_immediate_expiry_refetches() {
        let clock = Arc::new(ManualClock::new());
        let t = target(
            ScriptedFetcher {
                bodies: Mutex::new(vec![
                    (StatusCode::OK, vec![], b"1"),
                    (StatusCode::OK, vec![], b"2"),
                ]),
                calls: AtomicUsize::new(0),
            },
            clock.clone(),
        );
        let first = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(first.body, b"1");
        // max_age defaults to zero, so the entry is already stale the
        // instant the clock moves past the instant it was cached at.
        clock.advance(crate::clock::Duration::from_millis(1));
        let second = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(second.body, b"2");
        assert!(second.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("MISS"));
    }

    #[tokio::test]
    async fn s4_no_store_each_call_refetches() {
        let clock = Arc::new(ManualClock::new());
        let t = target(
            ScriptedFetcher {
                bodies: Mutex::new(vec![
                    (StatusCode::OK, vec![("cache-control", "must-revalidate")], b"1"),
                    (StatusCode::OK, vec![("cache-control", "no-store")], b"2"),
                    (StatusCode::OK, vec![("cache-control", "no-store")], b"3"),
                ]),
                calls: AtomicUsize::new(0),
            },
            clock.clone(),
        );
        let first = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(first.body, b"1");

        // must-revalidate doesn't affect valid_at; advance past the
        // zero-length max_age so the cached entry is actually stale.
        clock.advance(crate::clock::Duration::from_millis(1));
        let second = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(second.body, b"2");
        assert!(second.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("NOSTORE"));

        let third = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(third.body, b"3");
        assert!(third.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("NOSTORE"));
    }

    #[tokio::test]
    async fn s5_max_age_honoured() {
        let clock = Arc::new(ManualClock::new());
        let t = target(
            ScriptedFetcher {
                bodies: Mutex::new(vec![
                    (StatusCode::OK, vec![("cache-control", "max-age=60")], b"1"),
                    (StatusCode::OK, vec![("cache-control", "max-age=60")], b"2"),
                ]),
                calls: AtomicUsize::new(0),
            },
            clock.clone(),
        );
        let first = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(first.body, b"1");

        clock.advance(crate::clock::Duration::from_millis(10_000));
        let second = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(second.body, b"1");
        assert_eq!(second.headers.get("age").unwrap(), "10");
        assert!(second.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("HIT"));

        clock.advance(crate::clock::Duration::from_millis(51_000));
        let third = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(third.body, b"2");
        assert!(third.headers.get("snarfetch-status").unwrap().to_str().unwrap().starts_with("MISS"));
    }

    #[tokio::test]
    async fn fivehundred_transitions_to_fail_without_status_header() {
        let clock = Arc::new(ManualClock::new());
        let t = target(
            ScriptedFetcher {
                bodies: Mutex::new(vec![(StatusCode::INTERNAL_SERVER_ERROR, vec![], b"oops")]),
                calls: AtomicUsize::new(0),
            },
            clock,
        );
        let resp = t.fetch(&url(), &RequestInit::default()).await.unwrap();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.headers.get("snarfetch-status").is_none());
    }

    #[tokio::test]
    async fn gc_evicts_down_to_the_limit() {
        let clock = Arc::new(ManualClock::new());
        let t = Target::new(
            Arc::new(ScriptedFetcher { bodies: Mutex::new(vec![]), calls: AtomicUsize::new(0) }),
            Arc::new(crate::throttle::NoopThrottle),
            clock,
            Bytes::new(5),
        );
        {
            let mut known = t.known.lock().await;
            known.insert(
                "/a".to_string(),
                LocationStatus::Cached {
                    body: Arc::new(vec![0u8; 10]),
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    rules: crate::cache_rules::CacheRuleParameters::default(),
                    last_used: Instant::from_millis(0),
                },
            );
        }
        let kept = t.gc(Bytes::new(5)).await;
        assert_eq!(kept, Bytes::ZERO);
    }
}
