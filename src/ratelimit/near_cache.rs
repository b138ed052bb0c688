//! Local cache of counter keys known to be over limit.
//!
//! Only over-limit outcomes are recorded. An entry stays valid until the end
//! of its window; entries are also evicted least-recently-used once the byte
//! budget is exceeded.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::trace;

/// Approximate bookkeeping cost of one entry on top of its key.
const ENTRY_OVERHEAD_BYTES: usize = 64;

struct Slot {
    valid_until: u64,
    tick: u64,
}

#[derive(Default)]
struct Lru {
    slots: HashMap<String, Slot>,
    /// Recency order: oldest tick first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    used_bytes: usize,
}

impl Lru {
    fn remove(&mut self, key: &str) {
        if let Some(slot) = self.slots.remove(key) {
            self.order.remove(&slot.tick);
            self.used_bytes -= entry_cost(key);
        }
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        if let Some(slot) = self.slots.get_mut(key) {
            if let Some(owned) = self.order.remove(&slot.tick) {
                self.order.insert(tick, owned);
            }
            slot.tick = tick;
            self.next_tick += 1;
        }
    }

    fn evict_to(&mut self, budget: usize) {
        while self.used_bytes > budget {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            trace!(key = %key, "Evicting near-cache entry");
            self.slots.remove(&key);
            self.used_bytes -= entry_cost(&key);
        }
    }
}

fn entry_cost(key: &str) -> usize {
    key.len() + ENTRY_OVERHEAD_BYTES
}

/// Bounded, thread-safe over-limit cache.
pub struct NearCache {
    budget_bytes: usize,
    inner: Option<Mutex<Lru>>,
}

impl NearCache {
    /// Create a cache with the given byte budget; 0 disables it.
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            inner: (budget_bytes > 0).then(|| Mutex::new(Lru::default())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether `key` is known to be over limit at time `now`.
    pub fn lookup(&self, key: &str, now: u64) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let mut lru = inner.lock();
        match lru.slots.get(key).map(|slot| slot.valid_until) {
            Some(valid_until) if now < valid_until => {
                lru.touch(key);
                true
            }
            Some(_) => {
                lru.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remember that `key` is over limit until `valid_until` (exclusive).
    pub fn record_over_limit(&self, key: &str, valid_until: u64) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut lru = inner.lock();
        lru.remove(key);

        let tick = lru.next_tick;
        lru.next_tick += 1;
        lru.slots.insert(key.to_string(), Slot { valid_until, tick });
        lru.order.insert(tick, key.to_string());
        lru.used_bytes += entry_cost(key);
        lru.evict_to(self.budget_bytes);
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().used_bytes)
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("budget_bytes", &self.budget_bytes)
            .field("entries", &self.len())
            .finish()
    }
}
