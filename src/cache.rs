use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::consensus::Consensus;
use crate::executor::DEFAULT_TTL_SECS;
use crate::model::{
    ChosenUpstream, Confidence, FingerprintBody, Origin, QueryType, Record, ResolveOutcome,
    ResolveStatus, UpstreamAudit, UpstreamResult, fingerprint,
};

/// Version written into the persisted document.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub name: String,
    pub qtype: QueryType,
}

impl CacheKey {
    /// `name` must already be normalized.
    pub fn new(name: impl Into<String>, qtype: QueryType) -> Self {
        Self {
            name: name.into(),
            qtype,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.qtype)
    }
}

/// Where an entry stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { remaining: u64 },
    Stale { remaining: u64 },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query_name: String,
    pub query_type: QueryType,
    pub records: Vec<Record>,
    pub ttl_seconds: u32,
    pub status: ResolveStatus,
    pub confidence: Confidence,
    pub fingerprint: String,
    pub fetched_at: u64,
    pub expires_at: u64,
    pub stale_until: u64,
    pub upstreams_used: Vec<UpstreamAudit>,
    pub chosen_upstream: Option<ChosenUpstream>,
}

impl CacheEntry {
    /// Build the entry produced by one completed refresh.
    pub fn from_consensus(
        key: &CacheKey,
        results: &[UpstreamResult],
        consensus: &Consensus,
        now: u64,
        stale_grace_secs: u64,
    ) -> Self {
        let expires_at = now.saturating_add(u64::from(consensus.ttl_seconds));
        Self {
            query_name: key.name.clone(),
            query_type: key.qtype,
            records: consensus.chosen.records.clone(),
            ttl_seconds: consensus.ttl_seconds,
            status: consensus.status,
            confidence: consensus.confidence,
            fingerprint: consensus.chosen.fingerprint.clone(),
            fetched_at: now,
            expires_at,
            stale_until: expires_at.saturating_add(stale_grace_secs),
            upstreams_used: results.iter().map(UpstreamResult::audit).collect(),
            chosen_upstream: Some(consensus.chosen.chosen()),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.query_name.clone(), self.query_type)
    }

    pub fn freshness(&self, now: u64) -> Freshness {
        if now < self.expires_at {
            Freshness::Fresh {
                remaining: self.expires_at - now,
            }
        } else if now <= self.stale_until {
            Freshness::Stale {
                remaining: self.stale_until - now,
            }
        } else {
            Freshness::Expired
        }
    }

    /// Caller-facing view with `ttl_seconds` as the remaining lifetime.
    pub fn outcome(&self, origin: Origin, ttl_seconds: u32) -> ResolveOutcome {
        ResolveOutcome {
            query_name: self.query_name.clone(),
            query_type: self.query_type,
            records: self.records.clone(),
            ttl_seconds,
            origin,
            status: self.status,
            confidence: self.confidence,
            upstreams_used: self.upstreams_used.clone(),
            chosen_upstream: self.chosen_upstream.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// In-memory entry table, bounded by entry count.
pub struct CacheTable {
    entries: DashMap<CacheKey, Arc<CacheEntry>, FxBuildHasher>,
    max_entries: usize,
}

impl CacheTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher::default()),
            max_entries: max_entries.max(1),
        }
    }

    #[inline]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Insert or replace, then evict down to capacity. Returns the evicted count.
    pub fn insert(&self, entry: Arc<CacheEntry>) -> usize {
        self.entries.insert(entry.key(), entry);
        self.evict()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove oldest-refreshed entries until the table is within capacity.
    pub fn evict(&self) -> usize {
        let len = self.entries.len();
        if len <= self.max_entries {
            return 0;
        }
        let mut by_age: Vec<(u64, CacheKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().fetched_at, e.key().clone()))
            .collect();
        by_age.sort_unstable();
        let excess = len - self.max_entries;
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        debug!(evicted = excess, remaining = self.entries.len(), "cache eviction");
        excess
    }

    /// Point-in-time copy ordered by key string.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<CacheEntry>> {
        self.entries
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect()
    }
}

#[derive(Serialize)]
struct StoreDocument<'a> {
    version: u32,
    entries: BTreeMap<&'a str, &'a CacheEntry>,
}

/// Whole-table JSON persistence.
pub struct CacheStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted table. Never fails: unreadable documents and
    /// invalid entries are logged and skipped.
    pub fn load(&self, stale_grace_secs: u64) -> Vec<CacheEntry> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read cache store");
                return Vec::new();
            }
        };
        let entries = parse_document(&text, stale_grace_secs);
        match entries {
            Ok(entries) => {
                info!(path = %self.path.display(), entries = entries.len(), "cache store loaded");
                entries
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring cache store");
                Vec::new()
            }
        }
    }

    /// Write the whole table through a temporary sibling and rename it into place.
    pub async fn save(&self, table: &CacheTable) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = table.snapshot();
        let doc = StoreDocument {
            version: STORE_VERSION,
            entries: snapshot.iter().map(|(k, v)| (k.as_str(), v.as_ref())).collect(),
        };
        let body = serde_json::to_vec_pretty(&doc).context("serialize cache store")?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .context("cache store writer panicked")??;
        debug!(path = %self.path.display(), entries = snapshot.len(), "cache store saved");
        Ok(())
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create cache dir: {}", dir.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

/// One persisted entry as found on disk, including legacy field names.
#[derive(Deserialize)]
struct StoredEntry {
    #[serde(alias = "qname")]
    query_name: String,
    #[serde(alias = "qtype")]
    query_type: String,
    #[serde(default, alias = "answers")]
    records: Vec<StoredRecord>,
    #[serde(default, alias = "ttlS")]
    ttl_seconds: Option<u32>,
    #[serde(default)]
    status: Option<ResolveStatus>,
    #[serde(default)]
    confidence: Option<Confidence>,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(alias = "fetchedAt")]
    fetched_at: u64,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<u64>,
    #[serde(default, alias = "staleUntil")]
    stale_until: Option<u64>,
    #[serde(default)]
    upstreams_used: Vec<UpstreamAudit>,
    #[serde(default)]
    chosen_upstream: Option<ChosenUpstream>,
    /// Older tables only kept the adopted upstream's URL.
    #[serde(default)]
    upstream: Option<String>,
}

#[derive(Deserialize)]
struct StoredRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    rtype: Option<String>,
    #[serde(alias = "data")]
    value: String,
    #[serde(default, alias = "ttl")]
    ttl_seconds: Option<u32>,
}

fn parse_document(text: &str, stale_grace_secs: u64) -> anyhow::Result<Vec<CacheEntry>> {
    let doc: RawDocument = serde_json::from_str(text).context("parse cache store")?;
    if let Some(version) = doc.version {
        anyhow::ensure!(
            version == STORE_VERSION,
            "unsupported cache store version {}",
            version
        );
    }
    let mut entries = Vec::with_capacity(doc.entries.len());
    for (key, value) in doc.entries {
        match serde_json::from_value::<StoredEntry>(value) {
            Ok(stored) => match stored.into_entry(stale_grace_secs) {
                Some(entry) => entries.push(entry),
                None => debug!(key = %key, "dropping cache entry with invalid fields"),
            },
            Err(err) => debug!(key = %key, error = %err, "dropping malformed cache entry"),
        }
    }
    Ok(entries)
}

impl StoredEntry {
    fn into_entry(self, stale_grace_secs: u64) -> Option<CacheEntry> {
        let query_type: QueryType = self.query_type.parse().ok()?;
        let query_name = crate::model::normalize_name(&self.query_name);
        if query_name.is_empty() {
            return None;
        }

        let fetched_at = self.fetched_at;
        let ttl_seconds = self
            .ttl_seconds
            .or_else(|| {
                self.expires_at
                    .and_then(|e| e.checked_sub(fetched_at))
                    .and_then(|d| u32::try_from(d).ok())
            })
            .unwrap_or(DEFAULT_TTL_SECS);
        let expires_at = self
            .expires_at
            .unwrap_or(fetched_at.saturating_add(u64::from(ttl_seconds)))
            .max(fetched_at);
        let stale_until = self
            .stale_until
            .unwrap_or(expires_at.saturating_add(stale_grace_secs))
            .max(expires_at);

        let records: Vec<Record> = self
            .records
            .into_iter()
            .filter_map(|r| r.into_record(&query_name, query_type, ttl_seconds))
            .collect();
        let status = self.status.unwrap_or_default();
        let fingerprint = self.fingerprint.unwrap_or_else(|| {
            let values: Vec<String> = records.iter().map(|r| r.value.clone()).collect();
            let body = match status {
                ResolveStatus::Ok => FingerprintBody::Addresses(&values),
                ResolveStatus::NameNotFound => FingerprintBody::NameNotFound,
            };
            fingerprint(query_type, &query_name, body)
        });
        let chosen_upstream = self.chosen_upstream.or_else(|| {
            self.upstream.map(|source_url| ChosenUpstream {
                source_url,
                elapsed_ms: 0,
            })
        });

        Some(CacheEntry {
            query_name,
            query_type,
            records,
            ttl_seconds,
            status,
            confidence: self.confidence.unwrap_or_default(),
            fingerprint,
            fetched_at,
            expires_at,
            stale_until,
            upstreams_used: self.upstreams_used,
            chosen_upstream,
        })
    }
}

impl StoredRecord {
    fn into_record(self, owner: &str, qtype: QueryType, ttl: u32) -> Option<Record> {
        if let Some(rtype) = &self.rtype {
            if rtype.parse::<QueryType>().ok()? != qtype {
                return None;
            }
        }
        let value = self.value.trim();
        if value.is_empty() {
            return None;
        }
        Some(Record {
            name: self.name.unwrap_or_else(|| owner.to_string()),
            rtype: qtype,
            value: value.to_string(),
            ttl_seconds: self.ttl_seconds.unwrap_or(ttl),
        })
    }
}
