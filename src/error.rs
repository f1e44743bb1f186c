use thiserror::Error;

use crate::model::QueryType;

/// Errors surfaced to callers of [`crate::engine::Engine`].
///
/// Per-upstream failures never appear here: they are folded into
/// `FAILED` results by the executor. The type is `Clone` so a single
/// coalesced refresh can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Every upstream failed or timed out and no stale entry could be served.
    #[error("all upstreams failed for {qname} {qtype}")]
    UpstreamExhausted { qname: String, qtype: QueryType },

    /// The caller asked for a record type other than A/AAAA.
    #[error("unsupported query type: {0}")]
    UnsupportedQueryType(String),

    /// Rejected at construction time (empty upstream list, bad policy value).
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The query name is empty after normalization.
    #[error("invalid query name: {0:?}")]
    InvalidName(String),
}

impl ResolveError {
    /// Stable machine-readable kind, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::UpstreamExhausted { .. } => "UPSTREAM_EXHAUSTED",
            ResolveError::UnsupportedQueryType(_) => "UNSUPPORTED_QUERY_TYPE",
            ResolveError::ConfigurationInvalid(_) => "CONFIGURATION_INVALID",
            ResolveError::InvalidName(_) => "INVALID_NAME",
        }
    }
}
