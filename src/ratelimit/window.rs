//! Time units, clocks and fixed-window counter key derivation.
//!
//! Windows are aligned to the unix epoch: the window of a timestamp `now`
//! for a unit of `d` seconds starts at `now - now % d`. Every caller that
//! derives a key inside the same window gets the same key, which is what
//! lets concurrent increments from different instances meet on one counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::descriptor::{Descriptor, DescriptorKey, Entry};
use super::rules::MatchedLimit;

/// Time unit of a rate limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one window in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "s" => Ok(TimeUnit::Second),
            "minute" | "m" => Ok(TimeUnit::Minute),
            "hour" | "h" => Ok(TimeUnit::Hour),
            "day" | "d" => Ok(TimeUnit::Day),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

/// Clock abstraction so window boundaries can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds since the unix epoch.
    fn unix_now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The shared counter a descriptor maps to at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKey {
    /// `domain_k1_v1_..._windowstart`
    pub key: String,
    /// Epoch seconds at which the window opened
    pub window_start: u64,
    /// Un-jittered counter lifetime, equal to the unit length
    pub base_ttl: Duration,
    /// Time left until the next window opens
    pub reset_after: Duration,
}

impl WindowKey {
    /// Derive the counter key for `descriptor` at time `now`.
    pub fn derive(domain: &str, descriptor: &Descriptor, unit: TimeUnit, now: u64) -> Self {
        Self::derive_entries(domain, &descriptor.entries, unit, now)
    }

    /// Derive the counter key of a matched rule. Only the descriptor entries
    /// on the rule's key path take part, so every descriptor that resolves to
    /// the same node shares one counter.
    pub fn derive_for(limit: &MatchedLimit, descriptor: &Descriptor, now: u64) -> Self {
        let depth = limit.key_path.len().min(descriptor.entries.len());
        Self::derive_entries(&limit.domain, &descriptor.entries[..depth], limit.rule.unit, now)
    }

    fn derive_entries(domain: &str, entries: &[Entry], unit: TimeUnit, now: u64) -> Self {
        let unit_secs = unit.seconds();
        let window_start = now - now % unit_secs;

        let mut key = DescriptorKey::from_entries(domain, entries).to_string_key();
        key.push_str(&window_start.to_string());

        Self {
            key,
            window_start,
            base_ttl: unit.duration(),
            reset_after: Duration::from_secs(window_start + unit_secs - now),
        }
    }

    /// First second that no longer belongs to this window.
    pub fn window_end(&self) -> u64 {
        self.window_start + self.base_ttl.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitRule;

    #[test]
    fn test_time_unit_seconds() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_time_unit_from_str() {
        assert_eq!("second".parse::<TimeUnit>().unwrap(), TimeUnit::Second);
        assert_eq!("MINUTE".parse::<TimeUnit>().unwrap(), TimeUnit::Minute);
        assert_eq!("h".parse::<TimeUnit>().unwrap(), TimeUnit::Hour);
        assert!("fortnight".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn test_same_window_same_key() {
        let descriptor = Descriptor::new(&[("service", "checkout"), ("client_id", "42")]);

        let first = WindowKey::derive("svc", &descriptor, TimeUnit::Minute, 1_700_000_040);
        let last = WindowKey::derive("svc", &descriptor, TimeUnit::Minute, 1_700_000_099);

        assert_eq!(first.key, last.key);
        assert_eq!(first.base_ttl, last.base_ttl);
        assert_eq!(first.window_start, 1_700_000_040);
        assert_eq!(first.key, "svc_service_checkout_client\\_id_42_1700000040");
    }

    #[test]
    fn test_next_window_new_key() {
        let descriptor = Descriptor::new(&[("service", "checkout")]);

        let a = WindowKey::derive("svc", &descriptor, TimeUnit::Second, 1_000);
        let b = WindowKey::derive("svc", &descriptor, TimeUnit::Second, 1_001);

        assert_ne!(a.key, b.key);
        assert_eq!(a.window_end(), b.window_start);
    }

    #[test]
    fn test_reset_after() {
        let descriptor = Descriptor::new(&[("k", "v")]);

        let key = WindowKey::derive("d", &descriptor, TimeUnit::Hour, 7200 + 600);
        assert_eq!(key.window_start, 7200);
        assert_eq!(key.reset_after, Duration::from_secs(3000));

        let key = WindowKey::derive("d", &descriptor, TimeUnit::Day, 86400);
        assert_eq!(key.reset_after, Duration::from_secs(86400));
    }

    #[test]
    fn test_matched_key_path_bounds_the_key() {
        let limit = MatchedLimit::new(
            "svc",
            &["service"],
            RateLimitRule::new(10, TimeUnit::Minute),
        );
        let a = Descriptor::new(&[("service", "checkout"), ("client", "1")]);
        let b = Descriptor::new(&[("service", "checkout"), ("client", "2")]);

        let key_a = WindowKey::derive_for(&limit, &a, 1_700_000_040);
        let key_b = WindowKey::derive_for(&limit, &b, 1_700_000_040);

        assert_eq!(key_a, key_b);
        assert_eq!(key_a.key, "svc_service_checkout_1700000040");
        assert_eq!(key_a.base_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.unix_now(), 100);
        clock.advance(5);
        assert_eq!(clock.unix_now(), 105);
        clock.set(7);
        assert_eq!(clock.unix_now(), 7);
    }
}
