//! Process-wide dispatch across per-origin Targets, and the cross-Target
//! rebalancing pass.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, OnceLock,
};

use dashmap::DashMap;
use url::Url;

use crate::{
    clock::{Bytes, Clock, Duration, Instant, SystemClock},
    error::{CacheError, Result},
    fetcher::{Fetcher, RawResponse, RequestInit, UnconfiguredFetcher},
    target::Target,
    throttle::{SemaphoreThrottle, Throttle},
};

/// Construction options for a [`Coordinator`].
///
/// All fields are public; build one with struct-update syntax over
/// [`CoordinatorOptions::default`].
pub struct CoordinatorOptions {
    /// The out-of-scope HTTP fetch primitive. No sane default exists; the
    /// default coordinator uses [`UnconfiguredFetcher`] until
    /// [`init_default`] is called with a real one.
    pub fetcher: Arc<dyn Fetcher>,
    /// Produces one [`Throttle`] per Target, called lazily on first use of
    /// each origin.
    pub throttle_factory: Arc<dyn Fn() -> Arc<dyn Throttle> + Send + Sync>,
    /// Minimum spacing between global rebalancing passes.
    pub gc_interval: Duration,
    /// Total cached bytes allowed across all Targets.
    pub maximum_storage_bytes: Bytes,
    /// Cached bytes allowed for any single Target.
    pub maximum_storage_per_target_bytes: Bytes,
    /// The time source used by every Target this coordinator creates.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoordinatorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorOptions")
            .field("gc_interval", &self.gc_interval)
            .field("maximum_storage_bytes", &self.maximum_storage_bytes)
            .field(
                "maximum_storage_per_target_bytes",
                &self.maximum_storage_per_target_bytes,
            )
            .finish_non_exhaustive()
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            fetcher: Arc::new(UnconfiguredFetcher),
            throttle_factory: Arc::new(|| -> Arc<dyn Throttle> {
                Arc::new(SemaphoreThrottle::new(6))
            }),
            gc_interval: Duration::from_secs(60),
            maximum_storage_bytes: Bytes::mib(200),
            maximum_storage_per_target_bytes: Bytes::mib(50),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Routes calls to the Target for their origin, creating it lazily, and
/// periodically rebalances storage across every Target it owns.
pub struct Coordinator {
    targets: DashMap<String, Arc<Target>>,
    options: CoordinatorOptions,
    gc_in_progress: AtomicBool,
    next_gc_millis: AtomicI64,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("targets", &self.targets.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build a coordinator with no Targets yet created.
    pub fn new(options: CoordinatorOptions) -> Arc<Self> {
        let next_gc = options.clock.now();
        Arc::new(Coordinator {
            targets: DashMap::new(),
            gc_in_progress: AtomicBool::new(false),
            next_gc_millis: AtomicI64::new(next_gc.as_millis()),
            options,
        })
    }

    fn target_key(url: &Url) -> Result<String> {
        let host = url.host_str().ok_or_else(|| CacheError::NoHost(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(0);
        Ok(format!("{host}:{port}"))
    }

    /// Dispatch `url` to its Target (creating it on first use) and run a
    /// global rebalancing pass if one is due.
    pub async fn fetch(self: &Arc<Self>, url: &Url, init: &RequestInit) -> Result<RawResponse> {
        let key = Self::target_key(url)?;
        let target = self
            .targets
            .entry(key)
            .or_insert_with(|| {
                Target::new(
                    Arc::clone(&self.options.fetcher),
                    (self.options.throttle_factory)(),
                    Arc::clone(&self.options.clock),
                    self.options.maximum_storage_per_target_bytes,
                )
            })
            .clone();
        self.maybe_gc();
        target.fetch(url, init).await
    }

    fn maybe_gc(self: &Arc<Self>) {
        let now = self.options.clock.now();
        if self.gc_in_progress.load(Ordering::SeqCst) {
            return;
        }
        if now < Instant::from_millis(self.next_gc_millis.load(Ordering::SeqCst)) {
            return;
        }
        if self.gc_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_global_gc().await });
    }

    async fn run_global_gc(self: Arc<Self>) {
        let per_target_limit = self.options.maximum_storage_per_target_bytes;
        let targets: Vec<Arc<Target>> =
            self.targets.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut weighed = futures::future::join_all(targets.into_iter().map(|target| async move {
            let weight = target.gc(per_target_limit).await;
            (target, weight)
        }))
        .await;

        let total: Bytes = weighed.iter().map(|(_, w)| *w).sum();
        if total > self.options.maximum_storage_bytes {
            weighed.sort_by(|a, b| a.1.cmp(&b.1));
            let mut global_limit = self.options.maximum_storage_bytes;
            let mut remaining = weighed;
            while !remaining.is_empty() {
                let fair_share = global_limit.as_u64() / remaining.len() as u64;
                if fair_share > remaining[0].1.as_u64() {
                    let (_, below_share) = remaining.remove(0);
                    global_limit =
                        Bytes::new(global_limit.as_u64().saturating_sub(below_share.as_u64()));
                } else {
                    break;
                }
            }
            if !remaining.is_empty() {
                let fair_share = Bytes::new(global_limit.as_u64() / remaining.len() as u64);
                futures::future::join_all(remaining.iter().map(|(target, _)| {
                    let target = Arc::clone(target);
                    async move { target.gc(fair_share).await }
                }))
                .await;
            }
            log::debug!(
                "coordinator gc: total {total} exceeded limit {}, rebalanced across {} targets",
                self.options.maximum_storage_bytes,
                remaining.len()
            );
        }

        self.gc_in_progress.store(false, Ordering::SeqCst);
        let next_gc = self.options.clock.now().add(self.options.gc_interval);
        self.next_gc_millis.store(next_gc.as_millis(), Ordering::SeqCst);
    }
}

static DEFAULT_COORDINATOR: OnceLock<Arc<Coordinator>> = OnceLock::new();

/// Initialize the process-wide default coordinator with real options.
///
/// Must be called at most once, and before the first call to
/// [`default_coordinator`] that expects a working fetcher — calling this
/// after the default has already been lazily created (with the
/// always-failing placeholder), or calling it twice, returns
/// [`CacheError::AlreadyInitialized`].
pub fn init_default(options: CoordinatorOptions) -> Result<()> {
    DEFAULT_COORDINATOR
        .set(Coordinator::new(options))
        .map_err(|_| CacheError::AlreadyInitialized)
}

/// The process-wide default coordinator. If [`init_default`] was never
/// called, this lazily creates one whose fetcher always fails with
/// [`CacheError::NoFetcherConfigured`].
pub fn default_coordinator() -> Arc<Coordinator> {
    Arc::clone(
        DEFAULT_COORDINATOR.get_or_init(|| Coordinator::new(CoordinatorOptions::default())),
    )
}
