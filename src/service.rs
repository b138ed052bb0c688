//! Rate limit service: rule resolution, override filters and DoLimit.
//!
//! This is the surface a transport (gRPC, HTTP) would call into. It resolves
//! each descriptor to its rule, runs the cache, and folds the per-descriptor
//! verdicts into an overall decision.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{RateCacheError, Result};
use crate::filter::Filter;
use crate::ratelimit::{
    Code, DescriptorStatus, RateLimitCache, RateLimitRequest, RequestContext, RuleResolver,
};

/// What to answer when the limiter could not decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Allow the request
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// Overall decision plus one status per descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResponse {
    pub overall_code: Code,
    pub statuses: Vec<DescriptorStatus>,
}

/// Composes rule resolution, filters and a [`RateLimitCache`].
pub struct RateLimitService<C: RateLimitCache> {
    cache: Arc<C>,
    rules: Arc<dyn RuleResolver>,
    ip_filter: Filter,
    uid_filter: Filter,
    failure_mode: FailureMode,
}

impl<C: RateLimitCache> RateLimitService<C> {
    /// Build the service, validating the filter lists in `settings`.
    pub fn new(cache: Arc<C>, rules: Arc<dyn RuleResolver>, settings: &Settings) -> Result<Self> {
        let (ip_filter, uid_filter) = settings.filters()?;
        let failure_mode = if settings.failure_mode_deny {
            FailureMode::FailClosed
        } else {
            FailureMode::FailOpen
        };
        Ok(Self::with_filters(cache, rules, ip_filter, uid_filter, failure_mode))
    }

    pub fn with_filters(
        cache: Arc<C>,
        rules: Arc<dyn RuleResolver>,
        ip_filter: Filter,
        uid_filter: Filter,
        failure_mode: FailureMode,
    ) -> Self {
        Self {
            cache,
            rules,
            ip_filter,
            uid_filter,
            failure_mode,
        }
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Decide whether the request should be rate limited.
    #[instrument(
        skip(self, ctx, request),
        fields(
            domain = %request.domain,
            descriptor_count = request.descriptors.len(),
            hits_addend = request.hits_addend
        )
    )]
    pub async fn should_rate_limit(
        &self,
        ctx: &RequestContext,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResponse> {
        if request.domain.is_empty() {
            warn!("Received rate limit request with empty domain");
            return Err(RateCacheError::InvalidRequest("domain is required".to_string()));
        }

        let limits = self.rules.resolve_all(&request.domain, &request.descriptors);
        let unlimited = self.rules.is_unlimited(&request.domain);
        debug!(
            matched = limits.iter().filter(|l| l.is_some()).count(),
            unlimited,
            "Resolved rate limit rules"
        );

        let statuses = self
            .cache
            .do_limit(
                ctx,
                request,
                &limits,
                unlimited,
                &self.ip_filter,
                &self.uid_filter,
            )
            .await;

        let overall_code = self.overall_code(&statuses);
        info!(
            domain = %request.domain,
            overall_code = ?overall_code,
            "Rate limit decision made"
        );

        Ok(RateLimitResponse {
            overall_code,
            statuses,
        })
    }

    fn overall_code(&self, statuses: &[DescriptorStatus]) -> Code {
        if statuses.iter().any(|s| s.code == Code::OverLimit) {
            return Code::OverLimit;
        }
        if statuses.iter().any(|s| s.code == Code::Unavailable) {
            warn!(failure_mode = ?self.failure_mode, "Limiter unavailable for request");
            return match self.failure_mode {
                FailureMode::FailOpen => Code::Ok,
                FailureMode::FailClosed => Code::OverLimit,
            };
        }
        Code::Ok
    }
}
