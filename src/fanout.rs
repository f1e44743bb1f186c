use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::error::ResolveError;
use crate::executor::query_upstream;
use crate::model::{QueryType, UpstreamResult};
use crate::transport::Upstream;

/// Runs one query against every configured upstream with a concurrency cap.
#[derive(Debug, Clone)]
pub struct FanOut {
    upstreams: Arc<[Upstream]>,
    timeout: Duration,
    max_concurrency: usize,
}

impl FanOut {
    pub fn new(
        upstreams: Vec<Upstream>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Result<Self, ResolveError> {
        if upstreams.is_empty() {
            return Err(ResolveError::ConfigurationInvalid(
                "upstream list is empty".to_string(),
            ));
        }
        Ok(Self {
            upstreams: upstreams.into(),
            timeout,
            max_concurrency: max_concurrency.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Query every upstream and return all results in configuration order.
    ///
    /// Waits for every call (each bounded by the per-call timeout) because
    /// consensus needs the complete set.
    pub async fn run(&self, qname: &str, qtype: QueryType) -> Vec<UpstreamResult> {
        let permits = Semaphore::new(self.max_concurrency);
        let calls = self.upstreams.iter().map(|upstream| {
            let permits = &permits;
            async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = permits.acquire().await.ok();
                query_upstream(upstream, qname, qtype, self.timeout).await
            }
        });
        join_all(calls).await
    }
}
