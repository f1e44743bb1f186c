use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::rr::RecordType;
use tokio::time::timeout;
use tracing::debug;

use crate::model::{
    FingerprintBody, QueryType, Record, UpstreamResult, UpstreamStatus, fingerprint,
    normalize_name,
};
use crate::transport::{AnswerRecord, RawResponse, ResponseStatus, Upstream};

/// Alias hops followed before giving up on a chain.
pub const MAX_ALIAS_HOPS: usize = 10;
/// TTL used when a successful answer carries no records.
pub const DEFAULT_TTL_SECS: u32 = 60;
/// TTL attached to a name-not-found answer.
pub const NAME_NOT_FOUND_TTL_SECS: u32 = 30;

/// Query one upstream. Never fails: transport errors, bad response codes
/// and timeouts all come back as `FAILED` results.
pub async fn query_upstream(
    upstream: &Upstream,
    qname: &str,
    qtype: QueryType,
    timeout_dur: Duration,
) -> UpstreamResult {
    let start = Instant::now();
    let res = timeout(timeout_dur, upstream.exchange.exchange(qname, qtype)).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match res {
        Ok(Ok(raw)) => normalize(upstream.url.clone(), elapsed_ms, qname, qtype, raw),
        Ok(Err(err)) => {
            debug!(
                event = "upstream_failed",
                upstream = %upstream.url,
                qname = %qname,
                qtype = %qtype,
                elapsed_ms,
                error = %err,
                "upstream call failed"
            );
            failed(upstream.url.clone(), elapsed_ms, qname, qtype, FingerprintBody::Failed)
        }
        Err(_) => {
            debug!(
                event = "upstream_timeout",
                upstream = %upstream.url,
                qname = %qname,
                qtype = %qtype,
                timeout_ms = timeout_dur.as_millis() as u64,
                "upstream call timed out"
            );
            failed(upstream.url.clone(), elapsed_ms, qname, qtype, FingerprintBody::Timeout)
        }
    }
}

/// Turn a raw upstream answer into its canonical shape.
pub fn normalize(
    source_url: Arc<str>,
    elapsed_ms: u64,
    qname: &str,
    qtype: QueryType,
    raw: RawResponse,
) -> UpstreamResult {
    match raw.status {
        ResponseStatus::NoError => {}
        ResponseStatus::NameNotFound => {
            return UpstreamResult {
                source_url,
                elapsed_ms,
                status: UpstreamStatus::NameNotFound,
                alias_chain: Vec::new(),
                resolved_name: qname.to_string(),
                records: Vec::new(),
                address_set: Vec::new(),
                ttl_seconds: NAME_NOT_FOUND_TTL_SECS,
                fingerprint: fingerprint(qtype, qname, FingerprintBody::NameNotFound),
            };
        }
        ResponseStatus::Other(code) => {
            debug!(
                upstream = %source_url,
                qname = %qname,
                rcode = code,
                "upstream returned error rcode"
            );
            return failed(source_url, elapsed_ms, qname, qtype, FingerprintBody::Failed);
        }
    }

    let alias_chain = follow_aliases(qname, &raw.answers);
    let terminal = alias_chain.last().map(String::as_str).unwrap_or(qname);
    let mut resolved_name = terminal.to_string();
    let mut records = records_at(&raw.answers, terminal, qtype);
    if records.is_empty() && terminal != qname {
        records = records_at(&raw.answers, qname, qtype);
        if !records.is_empty() {
            resolved_name = qname.to_string();
        }
    }

    let address_set: Vec<String> = records.iter().map(|r| r.value.clone()).collect();
    let ttl_seconds = records
        .iter()
        .map(|r| r.ttl_seconds)
        .min()
        .unwrap_or(DEFAULT_TTL_SECS);
    let fingerprint = fingerprint(
        qtype,
        &resolved_name,
        FingerprintBody::Addresses(&address_set),
    );

    UpstreamResult {
        source_url,
        elapsed_ms,
        status: UpstreamStatus::Ok,
        alias_chain,
        resolved_name,
        records,
        address_set,
        ttl_seconds,
        fingerprint,
    }
}

fn failed(
    source_url: Arc<str>,
    elapsed_ms: u64,
    qname: &str,
    qtype: QueryType,
    body: FingerprintBody<'_>,
) -> UpstreamResult {
    UpstreamResult {
        source_url,
        elapsed_ms,
        status: UpstreamStatus::Failed,
        alias_chain: Vec::new(),
        resolved_name: qname.to_string(),
        records: Vec::new(),
        address_set: Vec::new(),
        ttl_seconds: 0,
        fingerprint: fingerprint(qtype, qname, body),
    }
}

/// Follow CNAME records starting at `qname`, stopping on a repeated name.
fn follow_aliases(qname: &str, answers: &[AnswerRecord]) -> Vec<String> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    seen.insert(qname.to_string());
    let mut current = qname.to_string();

    for _ in 0..MAX_ALIAS_HOPS {
        let next = answers
            .iter()
            .find(|a| a.rtype == RecordType::CNAME && normalize_name(&a.name) == current)
            .map(|a| normalize_name(&a.value));
        match next {
            Some(target) if !target.is_empty() && seen.insert(target.clone()) => {
                chain.push(target.clone());
                current = target;
            }
            _ => break,
        }
    }
    chain
}

/// Records of the requested type owned by `owner`, one per value, sorted by value.
fn records_at(answers: &[AnswerRecord], owner: &str, qtype: QueryType) -> Vec<Record> {
    let mut records: Vec<Record> = answers
        .iter()
        .filter(|a| a.rtype == qtype.record_type() && normalize_name(&a.name) == owner)
        .filter_map(|a| {
            let value = a.value.trim();
            (!value.is_empty()).then(|| Record {
                name: owner.to_string(),
                rtype: qtype,
                value: value.to_string(),
                ttl_seconds: a.ttl,
            })
        })
        .collect();
    // Lowest TTL wins among duplicates.
    records.sort_by(|a, b| a.value.cmp(&b.value).then(a.ttl_seconds.cmp(&b.ttl_seconds)));
    records.dedup_by(|next, kept| next.value == kept.value);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Reply, ScriptedExchange, answer, cname, nxdomain, ok_response};

    #[test]
    fn follows_alias_chain_to_terminal_records() {
        let raw = ok_response(vec![
            cname("www.netflix.com", "edge.netflix.net.", 60),
            answer("edge.netflix.net", RecordType::A, "203.0.113.55", 60),
        ]);
        let r = normalize("u1".into(), 5, "www.netflix.com", QueryType::A, raw);
        assert_eq!(r.status, UpstreamStatus::Ok);
        assert_eq!(r.alias_chain, vec!["edge.netflix.net".to_string()]);
        assert_eq!(r.resolved_name, "edge.netflix.net");
        assert_eq!(r.address_set, vec!["203.0.113.55".to_string()]);
        assert_eq!(r.records[0].name, "edge.netflix.net");
    }

    #[test]
    fn alias_cycle_stops_without_looping() {
        let raw = ok_response(vec![
            cname("a.test", "b.test", 60),
            cname("b.test", "a.test", 60),
            answer("a.test", RecordType::A, "192.0.2.1", 60),
        ]);
        let r = normalize("u1".into(), 1, "a.test", QueryType::A, raw);
        assert_eq!(r.alias_chain, vec!["b.test".to_string()]);
        // Nothing at b.test, so the query name's records are used.
        assert_eq!(r.resolved_name, "a.test");
        assert_eq!(r.address_set, vec!["192.0.2.1".to_string()]);
    }

    #[test]
    fn alias_chain_is_bounded() {
        let mut answers = Vec::new();
        for i in 0..20 {
            answers.push(cname(&format!("h{}.test", i), &format!("h{}.test", i + 1), 60));
        }
        let r = normalize("u1".into(), 1, "h0.test", QueryType::A, ok_response(answers));
        assert_eq!(r.alias_chain.len(), MAX_ALIAS_HOPS);
        assert_eq!(r.alias_chain.last().map(String::as_str), Some("h10.test"));
        assert!(r.records.is_empty());
        assert_eq!(r.ttl_seconds, DEFAULT_TTL_SECS);
        assert!(!r.is_usable());
    }

    #[test]
    fn records_are_deduplicated_sorted_and_min_ttl() {
        let raw = ok_response(vec![
            answer("example.com", RecordType::A, "203.0.113.20", 300),
            answer("Example.COM.", RecordType::A, "203.0.113.10", 250),
            answer("example.com", RecordType::A, "203.0.113.20", 100),
            answer("example.com", RecordType::AAAA, "2001:db8::1", 5),
        ]);
        let r = normalize("u1".into(), 1, "example.com", QueryType::A, raw);
        let values: Vec<_> = r.records.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["203.0.113.10", "203.0.113.20"]);
        assert_eq!(r.records[1].ttl_seconds, 100);
        assert_eq!(r.ttl_seconds, 100);
    }

    #[test]
    fn name_not_found_has_fixed_ttl_and_status_fingerprint() {
        let r = normalize("u1".into(), 1, "nope.example", QueryType::A, nxdomain());
        assert_eq!(r.status, UpstreamStatus::NameNotFound);
        assert_eq!(r.ttl_seconds, NAME_NOT_FOUND_TTL_SECS);
        assert!(r.records.is_empty());
        assert_eq!(
            r.fingerprint,
            fingerprint(QueryType::A, "nope.example", FingerprintBody::NameNotFound)
        );
    }

    #[test]
    fn error_rcode_is_failed() {
        let raw = RawResponse {
            status: ResponseStatus::Other(2),
            answers: Vec::new(),
        };
        let r = normalize("u1".into(), 1, "x.test", QueryType::A, raw);
        assert_eq!(r.status, UpstreamStatus::Failed);
        assert_eq!(r.fingerprint, fingerprint(QueryType::A, "x.test", FingerprintBody::Failed));
    }

    #[tokio::test]
    async fn transport_error_and_timeout_become_failed() {
        let failing = ScriptedExchange::upstream("https://a.test/dns-query", Reply::Fail);
        let r = query_upstream(&failing.0, "x.test", QueryType::A, Duration::from_secs(1)).await;
        assert_eq!(r.status, UpstreamStatus::Failed);
        assert_eq!(r.fingerprint, fingerprint(QueryType::A, "x.test", FingerprintBody::Failed));

        let hanging = ScriptedExchange::upstream("https://b.test/dns-query", Reply::Hang);
        let r = query_upstream(&hanging.0, "x.test", QueryType::A, Duration::from_millis(30)).await;
        assert_eq!(r.status, UpstreamStatus::Failed);
        assert_eq!(r.fingerprint, fingerprint(QueryType::A, "x.test", FingerprintBody::Timeout));
        assert!(r.elapsed_ms >= 25);
        assert_eq!(hanging.1.calls(), 1);
    }
}
