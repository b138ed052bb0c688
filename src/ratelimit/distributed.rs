//! Distributed rate limiter backed by a shared counter store.
//!
//! Per descriptor: unmatched and uncounted descriptors are allowed outright,
//! an override bypass allows the whole request, a near-cache hit rejects
//! without a round trip, and everything else becomes one increment queued to
//! the pipeline of the rule's unit. The increments of one request are
//! submitted together so they can share a batch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, trace, warn};

use super::descriptor::{RateLimitRequest, RequestContext};
use super::jitter::{ExpirationJitter, RandomSource, ThreadRandom};
use super::near_cache::NearCache;
use super::rules::{MatchedLimit, RateLimitRule};
use super::status::{Code, DescriptorStatus, LimitStats, StatsSnapshot};
use super::window::{Clock, SystemClock, WindowKey};
use crate::config::Settings;
use crate::error::Result;
use crate::filter::{decide_bypass, Filter};
use crate::store::{CounterOp, CounterPools};

/// How over-limit outcomes are surfaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnforcementPolicy {
    /// Enforce even rules that ask for shadow mode
    pub force_flag: bool,
    /// Shadow mode for every rule
    pub only_log_on_limit: bool,
    pub near_limit_ratio: f64,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            force_flag: false,
            only_log_on_limit: false,
            near_limit_ratio: 0.8,
        }
    }
}

impl EnforcementPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            force_flag: settings.force_flag,
            only_log_on_limit: settings.only_log_on_limit,
            near_limit_ratio: settings.near_limit_ratio,
        }
    }

    /// Whether an over-limit outcome for `rule` is reported as OK.
    /// The force flag wins over both per-rule and global shadow mode.
    pub fn shadow(&self, rule: &RateLimitRule) -> bool {
        !self.force_flag && (rule.shadow_mode || self.only_log_on_limit)
    }
}

enum Plan<'a> {
    Done(DescriptorStatus),
    Increment {
        limit: &'a MatchedLimit,
        window: WindowKey,
        shadow: bool,
    },
}

/// The rate limit cache engine.
pub struct DistributedRateLimiter {
    pools: CounterPools,
    clock: Arc<dyn Clock>,
    jitter: ExpirationJitter,
    near_cache: NearCache,
    policy: EnforcementPolicy,
    stats: LimitStats,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("pools", &self.pools)
            .field("jitter_max_secs", &self.jitter.max_secs())
            .field("near_cache", &self.near_cache)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DistributedRateLimiter {
    /// Create an engine over already constructed pools.
    pub fn new(
        pools: CounterPools,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        settings: &Settings,
    ) -> Self {
        Self {
            pools,
            clock,
            jitter: ExpirationJitter::new(settings.expiration_jitter_max_seconds, random),
            near_cache: NearCache::new(settings.local_cache_size_in_bytes),
            policy: EnforcementPolicy::from_settings(settings),
            stats: LimitStats::default(),
        }
    }

    /// Connect to the Redis pools from `settings` with the wall clock and
    /// thread RNG.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let pools = CounterPools::connect(settings).await?;
        Ok(Self::new(
            pools,
            Arc::new(SystemClock),
            Arc::new(ThreadRandom),
            settings,
        ))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn near_cache(&self) -> &NearCache {
        &self.near_cache
    }

    pub fn policy(&self) -> EnforcementPolicy {
        self.policy
    }

    /// Decide every descriptor of `request`; see [`super::RateLimitCache`].
    pub async fn do_limit(
        &self,
        ctx: &RequestContext,
        request: &RateLimitRequest,
        limits: &[Option<MatchedLimit>],
        unlimited: bool,
        ip_filter: &Filter,
        uid_filter: &Filter,
    ) -> Vec<DescriptorStatus> {
        let hits = request.hits();
        let now = self.clock.unix_now();
        let bypass = decide_bypass(&[ip_filter, uid_filter], ctx);

        if bypass {
            debug!(
                domain = %request.domain,
                source_ip = ?ctx.source_ip,
                source_uid = ?ctx.source_uid,
                "Override filter bypasses enforcement"
            );
        }

        let plans: Vec<Plan<'_>> = request
            .descriptors
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let Some(limit) = limits.get(index).and_then(Option::as_ref) else {
                    trace!(domain = %request.domain, index, "No rule matched descriptor");
                    return Plan::Done(DescriptorStatus::unlimited());
                };
                if unlimited || limit.rule.unlimited {
                    return Plan::Done(DescriptorStatus::uncounted(limit));
                }

                self.stats.add_total_hits(hits);
                if bypass {
                    self.stats.add_bypassed(hits);
                    return Plan::Done(DescriptorStatus::uncounted(limit));
                }

                let window = WindowKey::derive_for(limit, descriptor, now);
                let shadow = self.policy.shadow(&limit.rule);
                if !shadow && self.near_cache.lookup(&window.key, now) {
                    return Plan::Done(self.cached_over_limit(limit, &window, hits));
                }

                Plan::Increment {
                    limit,
                    window,
                    shadow,
                }
            })
            .collect();

        join_all(plans.into_iter().map(|plan| async move {
            match plan {
                Plan::Done(status) => status,
                Plan::Increment {
                    limit,
                    window,
                    shadow,
                } => self.increment(limit, window, shadow, hits).await,
            }
        }))
        .await
    }

    fn cached_over_limit(&self, limit: &MatchedLimit, window: &WindowKey, hits: u64) -> DescriptorStatus {
        debug!(key = %window.key, rule = %limit.full_key(), "Over limit (near-cache)");
        self.stats.add_over_limit(hits);
        self.stats.add_over_limit_with_local_cache(hits);

        DescriptorStatus {
            code: Code::OverLimit,
            current_limit: Some(limit.into()),
            current_count: None,
            limit_remaining: 0,
            duration_until_reset: Some(window.reset_after),
            shadowed: false,
        }
    }

    async fn increment(
        &self,
        limit: &MatchedLimit,
        window: WindowKey,
        shadow: bool,
        hits: u64,
    ) -> DescriptorStatus {
        let op = CounterOp {
            key: window.key.clone(),
            hits,
            ttl: self.jitter.ttl(window.base_ttl),
        };

        match self.pools.for_unit(limit.rule.unit).submit(op).await {
            Ok(count) => self.evaluate(limit, &window, shadow, count, hits),
            Err(err) => {
                self.stats.add_store_error();
                warn!(
                    key = %window.key,
                    error = %err,
                    "Counter store unavailable"
                );
                DescriptorStatus {
                    code: Code::Unavailable,
                    current_limit: Some(limit.into()),
                    current_count: None,
                    limit_remaining: 0,
                    duration_until_reset: Some(window.reset_after),
                    shadowed: false,
                }
            }
        }
    }

    fn evaluate(
        &self,
        limit: &MatchedLimit,
        window: &WindowKey,
        shadow: bool,
        count: u64,
        hits: u64,
    ) -> DescriptorStatus {
        let max = limit.rule.requests_per_unit;
        let mut status = DescriptorStatus {
            code: Code::Ok,
            current_limit: Some(limit.into()),
            current_count: Some(count),
            limit_remaining: max.saturating_sub(count),
            duration_until_reset: Some(window.reset_after),
            shadowed: false,
        };

        if count <= max {
            self.stats.add_within_limit(hits);
            let near_threshold = (max as f64 * self.policy.near_limit_ratio).floor() as u64;
            if count > near_threshold {
                self.stats.add_near_limit(count - near_threshold.max(count.saturating_sub(hits)));
            }
            trace!(key = %window.key, count, limit = max, "Within limit");
            return status;
        }

        // Only the hits that crossed the limit count as over limit
        let over = hits.min(count - max);
        self.stats.add_over_limit(over);
        self.stats.add_within_limit(hits - over);

        if shadow {
            self.stats.add_shadow_mode(hits);
            warn!(
                key = %window.key,
                rule = %limit.full_key(),
                count,
                limit = max,
                "Over limit in shadow mode, allowing"
            );
            status.shadowed = true;
        } else {
            debug!(
                key = %window.key,
                rule = %limit.full_key(),
                count,
                limit = max,
                "Rate limit exceeded"
            );
            self.near_cache.record_over_limit(&window.key, window.window_end());
            status.code = Code::OverLimit;
        }
        status
    }
}

#[async_trait]
impl super::backend::RateLimitCache for DistributedRateLimiter {
    async fn do_limit(
        &self,
        ctx: &RequestContext,
        request: &RateLimitRequest,
        limits: &[Option<MatchedLimit>],
        unlimited: bool,
        ip_filter: &Filter,
        uid_filter: &Filter,
    ) -> Vec<DescriptorStatus> {
        self.do_limit(ctx, request, limits, unlimited, ip_filter, uid_filter)
            .await
    }
}
