//! Override filters.
//!
//! A filter looks at the source identity of a request and may force the
//! request past quota enforcement. Deny-lists always win over allow-lists,
//! both within one filter and across filters.

mod ip;
mod uid;

pub use ip::IpFilter;
pub use uid::UidFilter;

use crate::ratelimit::RequestContext;

/// The opinion of a single filter about one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Source is deny-listed; enforcement must not be bypassed.
    Deny,
    /// Source is allow-listed; enforcement is bypassed.
    Allow,
    /// This filter has no opinion.
    Abstain,
}

/// An override filter over one identity dimension.
#[derive(Debug, Clone)]
pub enum Filter {
    Ip(IpFilter),
    Uid(UidFilter),
}

impl Filter {
    /// A filter with empty allow and deny sets.
    pub fn none() -> Self {
        Filter::Uid(UidFilter::default())
    }

    pub fn verdict(&self, ctx: &RequestContext) -> FilterVerdict {
        match self {
            Filter::Ip(filter) => match ctx.source_ip {
                Some(ip) => filter.verdict(ip),
                None => FilterVerdict::Abstain,
            },
            Filter::Uid(filter) => match ctx.source_uid.as_deref() {
                Some(uid) => filter.verdict(uid),
                None => FilterVerdict::Abstain,
            },
        }
    }

    /// Whether this filter alone forces the request past enforcement.
    pub fn bypass(&self, ctx: &RequestContext) -> bool {
        self.verdict(ctx) == FilterVerdict::Allow
    }
}

/// Combine several filters into one bypass decision.
///
/// Any deny vetoes the bypass; otherwise any allow grants it.
pub fn decide_bypass(filters: &[&Filter], ctx: &RequestContext) -> bool {
    let mut allowed = false;
    for filter in filters {
        match filter.verdict(ctx) {
            FilterVerdict::Deny => return false,
            FilterVerdict::Allow => allowed = true,
            FilterVerdict::Abstain => {}
        }
    }
    allowed
}
