use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hickory_proto::rr::RecordType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ResolveError;

/// Record types the engine resolves.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryType {
    A,
    AAAA,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::A => "A",
            QueryType::AAAA => "AAAA",
        }
    }

    #[inline]
    pub fn record_type(self) -> RecordType {
        match self {
            QueryType::A => RecordType::A,
            QueryType::AAAA => RecordType::AAAA,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(QueryType::A),
            "AAAA" => Ok(QueryType::AAAA),
            _ => Err(ResolveError::UnsupportedQueryType(s.to_string())),
        }
    }
}

impl TryFrom<RecordType> for QueryType {
    type Error = ResolveError;

    fn try_from(value: RecordType) -> Result<Self, Self::Error> {
        match value {
            RecordType::A => Ok(QueryType::A),
            RecordType::AAAA => Ok(QueryType::AAAA),
            other => Err(ResolveError::UnsupportedQueryType(other.to_string())),
        }
    }
}

/// Outcome of a single upstream call after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamStatus {
    Ok,
    NameNotFound,
    /// Transport error, non-success response code or timeout.
    Failed,
}

/// Status of a resolved answer. Only these two are ever cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolveStatus {
    #[default]
    Ok,
    NameNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

/// Where a [`ResolveOutcome`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cache,
    Upstream,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: QueryType,
    #[serde(alias = "data")]
    pub value: String,
    #[serde(alias = "ttl")]
    pub ttl_seconds: u32,
}

/// One upstream's normalized answer for one query. Never persisted.
#[derive(Debug, Clone)]
pub struct UpstreamResult {
    pub source_url: Arc<str>,
    pub elapsed_ms: u64,
    pub status: UpstreamStatus,
    /// Alias targets followed from the query name, in order.
    pub alias_chain: Vec<String>,
    /// Terminal name of the alias chain (the query name when there is none).
    pub resolved_name: String,
    /// Deduplicated by value, sorted by value.
    pub records: Vec<Record>,
    pub address_set: Vec<String>,
    pub ttl_seconds: u32,
    pub fingerprint: String,
}

impl UpstreamResult {
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.status == UpstreamStatus::Ok && !self.address_set.is_empty()
    }

    pub fn audit(&self) -> UpstreamAudit {
        UpstreamAudit {
            source_url: self.source_url.to_string(),
            elapsed_ms: self.elapsed_ms,
            status: self.status,
            record_count: self.records.len(),
        }
    }

    pub fn chosen(&self) -> ChosenUpstream {
        ChosenUpstream {
            source_url: self.source_url.to_string(),
            elapsed_ms: self.elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAudit {
    pub source_url: String,
    pub elapsed_ms: u64,
    pub status: UpstreamStatus,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChosenUpstream {
    pub source_url: String,
    pub elapsed_ms: u64,
}

/// What a caller of `Engine::resolve` gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    pub query_name: String,
    pub query_type: QueryType,
    pub records: Vec<Record>,
    /// Remaining lifetime from the caller's point of view, not the stored TTL.
    pub ttl_seconds: u32,
    pub origin: Origin,
    pub status: ResolveStatus,
    pub confidence: Confidence,
    pub upstreams_used: Vec<UpstreamAudit>,
    pub chosen_upstream: Option<ChosenUpstream>,
    pub fingerprint: String,
}

/// Lowercase, trim and strip trailing dots.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// What a fingerprint summarizes besides the query type and name.
#[derive(Debug, Clone, Copy)]
pub enum FingerprintBody<'a> {
    Addresses(&'a [String]),
    NameNotFound,
    Failed,
    Timeout,
}

/// Content hash used to compare answers across upstreams.
///
/// Addresses are sorted before hashing so collection order never matters.
pub fn fingerprint(qtype: QueryType, name: &str, body: FingerprintBody<'_>) -> String {
    let tail = match body {
        FingerprintBody::Addresses(values) => {
            let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            sorted.join(",")
        }
        FingerprintBody::NameNotFound => "NAME_NOT_FOUND".to_string(),
        FingerprintBody::Failed => "FAILED".to_string(),
        FingerprintBody::Timeout => "TIMEOUT".to_string(),
    };
    let mut hasher = Sha256::new();
    hasher.update(qtype.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(tail.as_bytes());
    hex::encode(hasher.finalize())
}
