//! Expiration jitter.
//!
//! Counters created at the same window boundary would otherwise all expire in
//! the same instant and the next window would start with a burst of
//! first-increments against the store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniformly distributed jitter values.
pub trait RandomSource: Send + Sync + std::fmt::Debug {
    /// A value uniformly drawn from `[0, upper]`.
    fn jitter(&self, upper: u64) -> u64;
}

/// Thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn jitter(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..=upper)
    }
}

/// Reproducible RNG seeded once.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn jitter(&self, upper: u64) -> u64 {
        self.rng.lock().gen_range(0..=upper)
    }
}

/// Always returns the same value, clamped to the requested bound.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub u64);

impl RandomSource for FixedRandom {
    fn jitter(&self, upper: u64) -> u64 {
        self.0.min(upper)
    }
}

/// Adds a bounded random extension to counter lifetimes.
#[derive(Debug, Clone)]
pub struct ExpirationJitter {
    max_secs: u64,
    source: Arc<dyn RandomSource>,
}

impl ExpirationJitter {
    pub fn new(max_secs: u64, source: Arc<dyn RandomSource>) -> Self {
        Self { max_secs, source }
    }

    pub fn max_secs(&self) -> u64 {
        self.max_secs
    }

    /// Effective TTL in `[base, base + max]` seconds.
    pub fn ttl(&self, base: Duration) -> Duration {
        if self.max_secs == 0 {
            return base;
        }
        base + Duration::from_secs(self.source.jitter(self.max_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_within_bounds() {
        let jitter = ExpirationJitter::new(300, Arc::new(SeededRandom::new(7)));
        let base = Duration::from_secs(60);

        for _ in 0..10_000 {
            let ttl = jitter.ttl(base);
            assert!(ttl >= base);
            assert!(ttl <= base + Duration::from_secs(300));
        }
    }

    #[test]
    fn test_bounds_are_reachable() {
        let base = Duration::from_secs(1);

        let low = ExpirationJitter::new(300, Arc::new(FixedRandom(0)));
        assert_eq!(low.ttl(base), base);

        let high = ExpirationJitter::new(300, Arc::new(FixedRandom(u64::MAX)));
        assert_eq!(high.ttl(base), Duration::from_secs(301));
    }

    #[test]
    fn test_zero_max_disables_jitter() {
        let jitter = ExpirationJitter::new(0, Arc::new(ThreadRandom));
        assert_eq!(jitter.ttl(Duration::from_secs(3600)), Duration::from_secs(3600));
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        let xs: Vec<u64> = (0..16).map(|_| a.jitter(1000)).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.jitter(1000)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_jitter_spreads_values() {
        let jitter = ExpirationJitter::new(300, Arc::new(SeededRandom::new(1)));
        let distinct: std::collections::HashSet<_> =
            (0..200).map(|_| jitter.ttl(Duration::from_secs(1))).collect();
        assert!(distinct.len() > 50);
    }
}
