use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::consensus::ConsensusPolicy;
use crate::error::ResolveError;
use crate::transport::Endpoint;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub version: Option<String>,
    /// Upstream resolvers, queried in this order.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,
    /// Per-call upstream timeout (milliseconds).
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Upstream calls in flight at once for one query.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Agreeing upstreams needed for high confidence. Absent: 2 with at
    /// least two upstreams, otherwise 1.
    #[serde(default)]
    pub quorum_min: Option<usize>,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
    /// How long past expiry an entry may still be served on refresh failure.
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    #[serde(default = "default_prefetch_fraction")]
    pub prefetch_fraction: f64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_ttl_cap_secs")]
    pub ttl_cap_secs: u32,
    /// Cache table file. Absent: memory only.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// UDP listen address for `serve`.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP listen address for `serve`.
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: None,
            upstreams: default_upstreams(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            quorum_min: None,
            overlap_ratio: default_overlap_ratio(),
            stale_grace_secs: default_stale_grace_secs(),
            prefetch_fraction: default_prefetch_fraction(),
            cache_max_entries: default_cache_max_entries(),
            ttl_cap_secs: default_ttl_cap_secs(),
            cache_path: None,
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
        }
    }
}

impl EngineConfig {
    pub fn quorum_min(&self) -> usize {
        self.quorum_min
            .unwrap_or(if self.upstreams.len() >= 2 { 2 } else { 1 })
    }

    #[inline]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn consensus_policy(&self) -> ConsensusPolicy {
        ConsensusPolicy {
            quorum_min: self.quorum_min(),
            overlap_ratio: self.overlap_ratio,
            ttl_cap_secs: self.ttl_cap_secs,
        }
    }

    pub fn validate(&self) -> Result<(), ResolveError> {
        let invalid = |msg: String| Err(ResolveError::ConfigurationInvalid(msg));
        if self.upstreams.is_empty() {
            return invalid("upstream list is empty".to_string());
        }
        for url in &self.upstreams {
            if let Err(e) = Endpoint::parse(url) {
                return invalid(format!("{:#}", e));
            }
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".to_string());
        }
        if self.quorum_min == Some(0) {
            return invalid("quorum_min must be at least 1".to_string());
        }
        if !(self.overlap_ratio > 0.0 && self.overlap_ratio <= 1.0) {
            return invalid(format!("overlap_ratio {} outside (0, 1]", self.overlap_ratio));
        }
        if !(self.prefetch_fraction >= 0.0 && self.prefetch_fraction < 1.0) {
            return invalid(format!(
                "prefetch_fraction {} outside [0, 1)",
                self.prefetch_fraction
            ));
        }
        if self.cache_max_entries == 0 {
            return invalid("cache_max_entries must be at least 1".to_string());
        }
        if self.ttl_cap_secs == 0 {
            return invalid("ttl_cap_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: EngineConfig = serde_json::from_str(&data).context("parse config json")?;
    cfg.validate()?;
    info!(
        path = %path.display(),
        version = ?cfg.version,
        upstreams = cfg.upstreams.len(),
        quorum_min = cfg.quorum_min(),
        "config loaded"
    );
    Ok(cfg)
}

fn default_upstreams() -> Vec<String> {
    vec![
        "https://cloudflare-dns.com/dns-query".to_string(),
        "https://dns.google/resolve".to_string(),
    ]
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_max_concurrency() -> usize {
    3
}

fn default_overlap_ratio() -> f64 {
    0.34
}

fn default_stale_grace_secs() -> u64 {
    1800
}

fn default_prefetch_fraction() -> f64 {
    0.1
}

fn default_cache_max_entries() -> usize {
    50_000
}

fn default_ttl_cap_secs() -> u32 {
    300
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}
