//! In-process counter store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CounterOp, CounterStore, StoreError};
use crate::ratelimit::Clock;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: u64,
}

/// Counters kept in a [`DashMap`] with expiry driven by an injected clock.
///
/// Stands in for the shared store in tests and single-process use. It can be
/// switched offline to exercise the store-unavailable path. Expired counters
/// are dropped at the start of every batch.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
    round_trips: AtomicU64,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            round_trips: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Number of batches received so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live value of a counter.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = self.clock.unix_now();
        self.counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
    }

    /// Expiry (epoch seconds) of a live counter.
    pub fn expires_at(&self, key: &str) -> Option<u64> {
        let now = self.clock.unix_now();
        self.counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.expires_at)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn increment(&self, op: &CounterOp, now: u64) -> u64 {
        let mut counter = self.counters.entry(op.key.clone()).or_insert(Counter {
            count: 0,
            expires_at: 0,
        });
        if counter.expires_at <= now {
            // first increment of a new (or expired) counter sets its lifetime
            counter.count = 0;
            counter.expires_at = now + op.ttl.as_secs();
        }
        counter.count += op.hits;
        counter.count
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_batch(&self, ops: &[CounterOp]) -> Result<Vec<u64>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        let now = self.clock.unix_now();
        self.counters.retain(|_, counter| counter.expires_at > now);
        Ok(ops.iter().map(|op| self.increment(op, now)).collect())
    }
}
