use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore, CacheTable, Freshness};
use crate::config::EngineConfig;
use crate::consensus::{ConsensusPolicy, decide};
use crate::error::ResolveError;
use crate::fanout::FanOut;
use crate::model::{Origin, QueryType, ResolveOutcome, normalize_name};
use crate::transport::Upstream;

/// Lower bound of the prefetch window, in seconds.
const MIN_PREFETCH_WINDOW_SECS: u64 = 5;

/// Source of wall-clock time in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

type RefreshResult = Result<Arc<CacheEntry>, ResolveError>;
type InflightMap = DashMap<CacheKey, Vec<oneshot::Sender<RefreshResult>>, FxBuildHasher>;

/// Removes the in-flight marker if the refresh is dropped before it notifies
/// its waiters, so they retry instead of hanging.
struct InflightCleanupGuard {
    inflight: Arc<InflightMap>,
    key: CacheKey,
    active: bool,
}

impl InflightCleanupGuard {
    fn new(inflight: Arc<InflightMap>, key: CacheKey) -> Self {
        Self {
            inflight,
            key,
            active: true,
        }
    }

    fn defuse(&mut self) {
        self.active = false;
    }
}

impl Drop for InflightCleanupGuard {
    fn drop(&mut self) {
        if self.active {
            self.inflight.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    stale_served: AtomicU64,
    refreshes: AtomicU64,
    prefetches: AtomicU64,
    exhausted: AtomicU64,
}

struct Inner {
    fanout: FanOut,
    policy: ConsensusPolicy,
    stale_grace_secs: u64,
    prefetch_fraction: f64,
    table: CacheTable,
    store: Option<CacheStore>,
    clock: Arc<dyn Clock>,
    // In-flight refreshes: key -> waiters attached to it
    inflight: Arc<InflightMap>,
    background: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    counters: Counters,
}

/// Multi-upstream resolver with a consensus step and a freshness cache.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine that talks to the configured upstream URLs.
    pub fn new(cfg: &EngineConfig) -> Result<Self, ResolveError> {
        cfg.validate()?;
        let timeout = cfg.upstream_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("quorumdns/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ResolveError::ConfigurationInvalid(format!("http client: {}", e)))?;
        let upstreams = cfg
            .upstreams
            .iter()
            .map(|url| {
                Upstream::from_url(url, &http, timeout)
                    .map_err(|e| ResolveError::ConfigurationInvalid(format!("{:#}", e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_upstreams(cfg, upstreams, Arc::new(SystemClock))
    }

    /// Build an engine over already constructed upstreams and clock.
    pub fn with_upstreams(
        cfg: &EngineConfig,
        upstreams: Vec<Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResolveError> {
        let fanout = FanOut::new(upstreams, cfg.upstream_timeout(), cfg.max_concurrency)?;
        let mut policy = cfg.consensus_policy();
        if cfg.quorum_min.is_none() {
            policy.quorum_min = if fanout.len() >= 2 { 2 } else { 1 };
        }

        let table = CacheTable::new(cfg.cache_max_entries);
        let store = cfg.cache_path.as_ref().map(|p| CacheStore::new(p.clone()));
        if let Some(store) = &store {
            for entry in store.load(cfg.stale_grace_secs) {
                table.insert(Arc::new(entry));
            }
        }

        info!(
            upstreams = fanout.len(),
            quorum_min = policy.quorum_min,
            cached = table.len(),
            persistent = store.is_some(),
            "engine ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                fanout,
                policy,
                stale_grace_secs: cfg.stale_grace_secs,
                prefetch_fraction: cfg.prefetch_fraction,
                table,
                store,
                clock,
                inflight: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
                background: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    pub fn metrics_snapshot(&self) -> String {
        let c = &self.inner.counters;
        format!(
            "requests={} cache_hits={} stale_served={} refreshes={} prefetches={} exhausted={} entries={} inflight={}",
            c.requests.load(Ordering::Relaxed),
            c.cache_hits.load(Ordering::Relaxed),
            c.stale_served.load(Ordering::Relaxed),
            c.refreshes.load(Ordering::Relaxed),
            c.prefetches.load(Ordering::Relaxed),
            c.exhausted.load(Ordering::Relaxed),
            self.inner.table.len(),
            self.inner.inflight.len(),
        )
    }

    /// Resolve `name` for a textual record type (`A` or `AAAA`).
    pub async fn resolve(&self, name: &str, qtype: &str) -> Result<ResolveOutcome, ResolveError> {
        let qtype: QueryType = qtype.parse()?;
        self.resolve_query(name, qtype).await
    }

    pub async fn resolve_query(
        &self,
        name: &str,
        qtype: QueryType,
    ) -> Result<ResolveOutcome, ResolveError> {
        let qname = normalize_name(name);
        if qname.is_empty() {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        let key = CacheKey::new(qname, qtype);

        let now = self.inner.clock.now();
        if let Some(entry) = self.inner.table.get(&key) {
            if let Freshness::Fresh { remaining } = entry.freshness(now) {
                self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                if remaining < self.inner.prefetch_window(entry.ttl_seconds) {
                    self.spawn_prefetch(key.clone());
                }
                debug!(
                    event = "dns_response",
                    qname = %key.name,
                    qtype = %qtype,
                    origin = "cache",
                    confidence = ?entry.confidence,
                    ttl = remaining,
                    "cache hit"
                );
                return Ok(entry.outcome(Origin::Cache, clamp_ttl(remaining)));
            }
        }

        match self.refresh(&key).await {
            Ok((entry, origin)) => {
                let remaining = entry.expires_at.saturating_sub(self.inner.clock.now());
                Ok(entry.outcome(origin, clamp_ttl(remaining)))
            }
            Err(err) => self.inner.fallback(&key, err),
        }
    }

    /// Run a refresh for `key`, or attach to the one already in flight.
    /// The origin is `Cache` when a fresh entry turned up after all.
    async fn refresh(&self, key: &CacheKey) -> Result<(Arc<CacheEntry>, Origin), ResolveError> {
        loop {
            let rx = match self.inner.inflight.entry(key.clone()) {
                Entry::Occupied(mut o) => {
                    let (tx, rx) = oneshot::channel();
                    o.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(v) => {
                    v.insert(Vec::new());
                    None
                }
            };

            let Some(rx) = rx else {
                let mut guard = InflightCleanupGuard::new(self.inner.inflight.clone(), key.clone());
                // Another caller may have finished a refresh between our cache
                // lookup and claiming the slot.
                let now = self.inner.clock.now();
                let (result, origin) = match self.inner.table.get(key) {
                    Some(entry) if matches!(entry.freshness(now), Freshness::Fresh { .. }) => {
                        (Ok(entry), Origin::Cache)
                    }
                    _ => (self.inner.run_refresh(key).await, Origin::Upstream),
                };
                guard.defuse();
                self.inner.notify_inflight_waiters(key, &result);
                return result.map(|entry| (entry, origin));
            };

            match rx.await {
                Ok(result) => return result.map(|entry| (entry, Origin::Upstream)),
                // The leader was dropped before finishing; try again.
                Err(_) => continue,
            }
        }
    }

    /// Start a background refresh unless one is already running for `key`
    /// or the engine is shutting down.
    fn spawn_prefetch(&self, key: CacheKey) {
        let mut tasks = self.inner.background();
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(v) => {
                v.insert(Vec::new());
            }
        }
        // Reap finished prefetches so the set does not grow.
        while tasks.try_join_next().is_some() {}

        self.inner.counters.prefetches.fetch_add(1, Ordering::Relaxed);
        let mut guard = InflightCleanupGuard::new(self.inner.inflight.clone(), key.clone());
        let inner = self.inner.clone();
        tasks.spawn(async move {
            let result = inner.run_refresh(&key).await;
            guard.defuse();
            inner.notify_inflight_waiters(&key, &result);
            if let Err(err) = result {
                warn!(
                    event = "prefetch_failed",
                    qname = %key.name,
                    qtype = %key.qtype,
                    error = %err,
                    "background refresh failed; keeping cached entry"
                );
            }
        });
    }

    /// Stop background work and flush the cache table.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.inner.background();
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        self.inner.persist().await;
        info!(
            event = "engine_shutdown",
            entries = self.inner.table.len(),
            metrics = %self.metrics_snapshot(),
            "engine stopped"
        );
    }
}

impl Inner {
    fn background(&self) -> MutexGuard<'_, JoinSet<()>> {
        match self.background.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn prefetch_window(&self, ttl_seconds: u32) -> u64 {
        let window = (f64::from(ttl_seconds) * self.prefetch_fraction).floor() as u64;
        window.max(MIN_PREFETCH_WINDOW_SECS)
    }

    /// Fan out, reconcile, store and persist. Leaves the table untouched on failure.
    async fn run_refresh(&self, key: &CacheKey) -> RefreshResult {
        let start = Instant::now();
        let results = self.fanout.run(&key.name, key.qtype).await;
        let Some(consensus) = decide(&results, &self.policy) else {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = "upstream_exhausted",
                qname = %key.name,
                qtype = %key.qtype,
                upstreams = results.len(),
                latency_ms = start.elapsed().as_millis() as u64,
                "no upstream produced an answer"
            );
            return Err(ResolveError::UpstreamExhausted {
                qname: key.name.clone(),
                qtype: key.qtype,
            });
        };

        let now = self.clock.now();
        let entry = Arc::new(CacheEntry::from_consensus(
            key,
            &results,
            &consensus,
            now,
            self.stale_grace_secs,
        ));
        let evicted = self.table.insert(entry.clone());
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        info!(
            event = "dns_refresh",
            qname = %key.name,
            qtype = %key.qtype,
            status = ?entry.status,
            confidence = ?entry.confidence,
            upstream = %consensus.chosen.source_url,
            agreeing = consensus.considered.len(),
            ttl = entry.ttl_seconds,
            latency_ms = start.elapsed().as_millis() as u64,
            evicted,
            "refresh complete"
        );
        self.persist().await;
        Ok(entry)
    }

    fn notify_inflight_waiters(&self, key: &CacheKey, result: &RefreshResult) {
        if let Some((_, waiters)) = self.inflight.remove(key) {
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        }
    }

    /// Serve whatever the table still holds for `key` after a failed refresh.
    fn fallback(&self, key: &CacheKey, err: ResolveError) -> Result<ResolveOutcome, ResolveError> {
        let Some(entry) = self.table.get(key) else {
            return Err(err);
        };
        match entry.freshness(self.clock.now()) {
            Freshness::Fresh { remaining } => {
                Ok(entry.outcome(Origin::Cache, clamp_ttl(remaining)))
            }
            Freshness::Stale { remaining } => {
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = "dns_response",
                    qname = %key.name,
                    qtype = %key.qtype,
                    origin = "stale",
                    ttl = remaining,
                    error = %err,
                    "serving stale entry"
                );
                Ok(entry.outcome(Origin::Stale, clamp_ttl(remaining)))
            }
            Freshness::Expired => Err(err),
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(&self.table).await {
            warn!(path = %store.path().display(), error = %err, "failed to persist cache");
        }
    }
}

#[inline]
fn clamp_ttl(secs: u64) -> u32 {
    u32::try_from(secs).unwrap_or(u32::MAX)
}
