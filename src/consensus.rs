use std::collections::HashSet;

use crate::model::{Confidence, ResolveStatus, UpstreamResult, UpstreamStatus};

/// TTL ceiling when only partial agreement was found.
pub const MEDIUM_TTL_CEILING: u32 = 120;
/// TTL ceiling when no two upstreams agree.
pub const LOW_TTL_CEILING: u32 = 30;
/// TTL ceiling (and default) for name-not-found answers.
pub const NAME_NOT_FOUND_TTL_CEILING: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusPolicy {
    pub quorum_min: usize,
    pub overlap_ratio: f64,
    pub ttl_cap_secs: u32,
}

/// The reconciled answer for one query.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub status: ResolveStatus,
    pub confidence: Confidence,
    pub chosen: UpstreamResult,
    /// Results that backed the decision.
    pub considered: Vec<UpstreamResult>,
    pub ttl_seconds: u32,
}

/// Reconcile every upstream's result for one query.
///
/// Returns `None` when no upstream produced a usable answer or a
/// name-not-found, i.e. every upstream failed.
pub fn decide(results: &[UpstreamResult], policy: &ConsensusPolicy) -> Option<Consensus> {
    let usable: Vec<&UpstreamResult> = results.iter().filter(|r| r.is_usable()).collect();
    if !usable.is_empty() {
        return Some(agree(&usable, policy));
    }

    let not_found: Vec<&UpstreamResult> = results
        .iter()
        .filter(|r| r.status == UpstreamStatus::NameNotFound)
        .collect();
    let chosen = fastest(&not_found)?;
    let confidence = if not_found.len() >= policy.quorum_min {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    let ttl = min_ttl(&not_found).unwrap_or(NAME_NOT_FOUND_TTL_CEILING);
    Some(Consensus {
        status: ResolveStatus::NameNotFound,
        confidence,
        chosen: chosen.clone(),
        considered: not_found.into_iter().cloned().collect(),
        ttl_seconds: ttl.min(NAME_NOT_FOUND_TTL_CEILING).max(1),
    })
}

fn agree(usable: &[&UpstreamResult], policy: &ConsensusPolicy) -> Consensus {
    let strongest = strongest_group(usable);
    if strongest.len() >= policy.quorum_min {
        let chosen = fastest(&strongest).unwrap_or(strongest[0]);
        let ttl = min_ttl(&strongest).unwrap_or(chosen.ttl_seconds);
        return Consensus {
            status: ResolveStatus::Ok,
            confidence: Confidence::High,
            chosen: chosen.clone(),
            considered: strongest.iter().map(|r| (*r).clone()).collect(),
            ttl_seconds: ttl.min(policy.ttl_cap_secs).max(1),
        };
    }

    let candidates = overlapping(usable, policy.overlap_ratio);
    if let Some(chosen) = fastest(&candidates) {
        let ttl = min_ttl(&candidates).unwrap_or(chosen.ttl_seconds);
        return Consensus {
            status: ResolveStatus::Ok,
            confidence: Confidence::Medium,
            chosen: chosen.clone(),
            considered: candidates.iter().map(|r| (*r).clone()).collect(),
            ttl_seconds: ttl.min(policy.ttl_cap_secs).min(MEDIUM_TTL_CEILING).max(1),
        };
    }

    // `usable` is non-empty here.
    let chosen = fastest(usable).unwrap_or(usable[0]);
    Consensus {
        status: ResolveStatus::Ok,
        confidence: Confidence::Low,
        chosen: chosen.clone(),
        considered: vec![chosen.clone()],
        ttl_seconds: chosen
            .ttl_seconds
            .min(policy.ttl_cap_secs)
            .min(LOW_TTL_CEILING)
            .max(1),
    }
}

/// Largest fingerprint group; on a tie the group seen first in input order.
fn strongest_group<'a>(usable: &[&'a UpstreamResult]) -> Vec<&'a UpstreamResult> {
    let mut groups: Vec<(&str, Vec<&'a UpstreamResult>)> = Vec::new();
    for r in usable {
        match groups.iter_mut().find(|(fp, _)| *fp == r.fingerprint) {
            Some((_, members)) => members.push(*r),
            None => groups.push((r.fingerprint.as_str(), vec![*r])),
        }
    }
    let mut best: Vec<&'a UpstreamResult> = Vec::new();
    for (_, members) in groups {
        if members.len() > best.len() {
            best = members;
        }
    }
    best
}

/// Members of every pair that shares an address or overlaps enough,
/// deduplicated by upstream URL and kept in input order.
fn overlapping<'a>(usable: &[&'a UpstreamResult], threshold: f64) -> Vec<&'a UpstreamResult> {
    let mut picked = vec![false; usable.len()];
    for i in 0..usable.len() {
        for j in (i + 1)..usable.len() {
            let (a, b) = (&usable[i].address_set, &usable[j].address_set);
            if shared_count(a, b) > 0 || overlap_ratio(a, b) >= threshold {
                picked[i] = true;
                picked[j] = true;
            }
        }
    }
    let mut seen = HashSet::new();
    usable
        .iter()
        .zip(picked)
        .filter(|(r, p)| *p && seen.insert(r.source_url.clone()))
        .map(|(r, _)| *r)
        .collect()
}

/// Both sets are sorted.
fn shared_count(a: &[String], b: &[String]) -> usize {
    a.iter().filter(|v| b.binary_search(v).is_ok()).count()
}

/// Lowest latency; the earliest in input order on a tie.
fn fastest<'a>(results: &[&'a UpstreamResult]) -> Option<&'a UpstreamResult> {
    results.iter().copied().min_by_key(|r| r.elapsed_ms)
}

fn min_ttl(results: &[&UpstreamResult]) -> Option<u32> {
    results.iter().map(|r| r.ttl_seconds).min()
}

/// Overlap ratio of two address sets: shared values over the smaller set.
pub fn overlap_ratio(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    shared_count(a, b) as f64 / a.len().min(b.len()) as f64
}
