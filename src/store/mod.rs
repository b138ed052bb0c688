//! Shared counter store clients.
//!
//! A store only knows how to atomically increment a batch of counters.
//! Batching across concurrent requests happens in [`PipelineBatcher`].

mod memory;
mod pipeline;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::pipeline::{CounterPools, PipelineBatcher};
pub use self::redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a counter store. Cloneable so one failed round trip
/// can be reported to every operation that was part of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store returned {got} results for {expected} operations")]
    ResultMismatch { expected: usize, got: usize },

    #[error("pipeline batcher is shut down")]
    Closed,
}

/// One atomic increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterOp {
    pub key: String,
    pub hits: u64,
    /// Lifetime applied only when this increment creates the counter
    pub ttl: Duration,
}

/// A shared store of expiring counters.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Increment every counter in one round trip, returning the
    /// post-increment values in operation order.
    async fn increment_batch(&self, ops: &[CounterOp]) -> Result<Vec<u64>, StoreError>;
}
