//! The DoLimit contract consumed by the service layer.

use async_trait::async_trait;

use super::descriptor::{RateLimitRequest, RequestContext};
use super::rules::MatchedLimit;
use super::status::DescriptorStatus;
use crate::filter::Filter;

/// Trait for rate limit cache implementations.
///
/// This lets the service layer run against the distributed engine or a
/// test double.
#[async_trait]
pub trait RateLimitCache: Send + Sync {
    /// Decide every descriptor of `request`.
    ///
    /// `limits[i]` is the rule resolved for `request.descriptors[i]` (`None`
    /// when unmatched). The result has exactly one status per descriptor, in
    /// the same order.
    async fn do_limit(
        &self,
        ctx: &RequestContext,
        request: &RateLimitRequest,
        limits: &[Option<MatchedLimit>],
        unlimited: bool,
        ip_filter: &Filter,
        uid_filter: &Filter,
    ) -> Vec<DescriptorStatus>;
}
