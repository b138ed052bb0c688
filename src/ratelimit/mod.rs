//! Rate limiting logic and state management.

mod backend;
mod descriptor;
mod distributed;
mod jitter;
mod near_cache;
mod rules;
mod status;
mod window;

pub use backend::RateLimitCache;
pub use descriptor::{Descriptor, DescriptorKey, Entry, RateLimitRequest, RequestContext};
pub use distributed::{DistributedRateLimiter, EnforcementPolicy};
pub use jitter::{ExpirationJitter, FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use near_cache::NearCache;
pub use rules::{
    DescriptorConfig, DomainConfig, MatchedLimit, RateLimitConfig, RateLimitRule, RuleResolver,
};
pub use status::{Code, CurrentLimit, DescriptorStatus, LimitStats, StatsSnapshot};
pub use window::{Clock, ManualClock, SystemClock, TimeUnit, WindowKey};
