//! Per-descriptor verdicts and engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::rules::MatchedLimit;
use super::window::TimeUnit;

/// Outcome for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    OverLimit,
    /// The counter store could not be reached; the limiter could not decide.
    Unavailable,
}

/// The limit that produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentLimit {
    pub name: Option<String>,
    pub requests_per_unit: u64,
    pub unit: TimeUnit,
}

impl From<&MatchedLimit> for CurrentLimit {
    fn from(limit: &MatchedLimit) -> Self {
        Self {
            name: limit.rule.name.clone(),
            requests_per_unit: limit.rule.requests_per_unit,
            unit: limit.rule.unit,
        }
    }
}

/// Verdict for one descriptor, positionally aligned with the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorStatus {
    pub code: Code,
    pub current_limit: Option<CurrentLimit>,
    /// Post-increment counter value, when the store was consulted
    pub current_count: Option<u64>,
    pub limit_remaining: u64,
    pub duration_until_reset: Option<Duration>,
    /// The counter was over limit but shadow mode reported OK
    pub shadowed: bool,
}

impl DescriptorStatus {
    /// OK with no quota information, for descriptors without a rule.
    pub fn unlimited() -> Self {
        Self {
            code: Code::Ok,
            current_limit: None,
            current_count: None,
            limit_remaining: 0,
            duration_until_reset: None,
            shadowed: false,
        }
    }

    /// OK without counting, for bypassed or uncounted descriptors.
    pub fn uncounted(limit: &MatchedLimit) -> Self {
        Self {
            code: Code::Ok,
            current_limit: Some(limit.into()),
            current_count: None,
            limit_remaining: limit.rule.requests_per_unit,
            duration_until_reset: None,
            shadowed: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Running counters describing what the engine decided.
#[derive(Debug, Default)]
pub struct LimitStats {
    total_hits: AtomicU64,
    within_limit: AtomicU64,
    over_limit: AtomicU64,
    over_limit_with_local_cache: AtomicU64,
    near_limit: AtomicU64,
    shadow_mode: AtomicU64,
    bypassed: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`LimitStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_hits: u64,
    pub within_limit: u64,
    pub over_limit: u64,
    pub over_limit_with_local_cache: u64,
    pub near_limit: u64,
    pub shadow_mode: u64,
    pub bypassed: u64,
    pub store_errors: u64,
}

impl LimitStats {
    pub fn add_total_hits(&self, hits: u64) {
        self.total_hits.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_within_limit(&self, hits: u64) {
        self.within_limit.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_over_limit(&self, hits: u64) {
        self.over_limit.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_over_limit_with_local_cache(&self, hits: u64) {
        self.over_limit_with_local_cache.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_near_limit(&self, hits: u64) {
        self.near_limit.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_shadow_mode(&self, hits: u64) {
        self.shadow_mode.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_bypassed(&self, hits: u64) {
        self.bypassed.fetch_add(hits, Ordering::Relaxed);
    }

    pub fn add_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_hits: self.total_hits.load(Ordering::Relaxed),
            within_limit: self.within_limit.load(Ordering::Relaxed),
            over_limit: self.over_limit.load(Ordering::Relaxed),
            over_limit_with_local_cache: self.over_limit_with_local_cache.load(Ordering::Relaxed),
            near_limit: self.near_limit.load(Ordering::Relaxed),
            shadow_mode: self.shadow_mode.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
