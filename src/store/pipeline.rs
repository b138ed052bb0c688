//! Pipeline batcher.
//!
//! Operations from concurrent requests are queued to a single worker task
//! that owns the open batch. The worker flushes when the batch reaches the
//! size limit or when the pipeline window has elapsed since the first
//! operation arrived, whichever comes first. Each flush is dispatched on its
//! own task as one store round trip and the results are routed back to the
//! waiting callers.
//!
//! A caller that goes away after enqueueing does not retract its operation:
//! the increment is still sent, its result is just dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{CounterOp, CounterStore, RedisStore, StoreError};
use crate::config::{PipelineSettings, Settings};
use crate::error::Result;
use crate::ratelimit::TimeUnit;

/// Depth of the queue in front of the batching worker.
const QUEUE_DEPTH: usize = 4096;

type Reply = oneshot::Sender<std::result::Result<u64, StoreError>>;

struct Pending {
    op: CounterOp,
    reply: Reply,
}

/// Coalesces counter operations into batched store round trips.
#[derive(Debug, Clone)]
pub struct PipelineBatcher {
    tx: mpsc::Sender<Pending>,
    settings: PipelineSettings,
}

impl PipelineBatcher {
    /// Start the batching worker for `store`. Must be called from within a
    /// tokio runtime.
    pub fn spawn(store: Arc<dyn CounterStore>, settings: PipelineSettings) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_worker(store, settings, rx));
        Self { tx, settings }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Queue one increment and wait for its post-increment value.
    pub async fn submit(&self, op: CounterOp) -> std::result::Result<u64, StoreError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Pending { op, reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("op", &self.op).finish()
    }
}

async fn run_worker(
    store: Arc<dyn CounterStore>,
    settings: PipelineSettings,
    mut rx: mpsc::Receiver<Pending>,
) {
    let limit = settings.limit.max(1);

    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(limit);
        batch.push(first);

        if settings.window.is_zero() {
            // no implicit pipelining: take only what is already queued
            while batch.len() < limit {
                match rx.try_recv() {
                    Ok(pending) => batch.push(pending),
                    Err(_) => break,
                }
            }
        } else {
            let deadline = Instant::now() + settings.window;
            while batch.len() < limit {
                tokio::select! {
                    biased;
                    next = rx.recv() => match next {
                        Some(pending) => batch.push(pending),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        trace!(size = batch.len(), "Flushing pipeline batch");
        tokio::spawn(dispatch(store.clone(), batch));
    }

    debug!("Pipeline batcher stopped");
}

async fn dispatch(store: Arc<dyn CounterStore>, batch: Vec<Pending>) {
    let (ops, replies): (Vec<CounterOp>, Vec<Reply>) =
        batch.into_iter().map(|p| (p.op, p.reply)).unzip();

    let result = store.increment_batch(&ops).await.and_then(|counts| {
        if counts.len() == ops.len() {
            Ok(counts)
        } else {
            Err(StoreError::ResultMismatch {
                expected: ops.len(),
                got: counts.len(),
            })
        }
    });

    match result {
        Ok(counts) => {
            for (reply, count) in replies.into_iter().zip(counts) {
                // receiver may be gone if the caller was cancelled
                let _ = reply.send(Ok(count));
            }
        }
        Err(err) => {
            warn!(error = %err, size = ops.len(), "Pipeline batch failed");
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

/// The standard pool plus the optional isolated per-second pool.
#[derive(Debug, Clone)]
pub struct CounterPools {
    standard: PipelineBatcher,
    per_second: Option<PipelineBatcher>,
}

impl CounterPools {
    pub fn new(standard: PipelineBatcher, per_second: Option<PipelineBatcher>) -> Self {
        Self {
            standard,
            per_second,
        }
    }

    /// A single pool serving every unit.
    pub fn single(store: Arc<dyn CounterStore>, settings: PipelineSettings) -> Self {
        Self::new(PipelineBatcher::spawn(store, settings), None)
    }

    /// Connect the Redis pools described by `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let standard_settings = settings.standard_store();
        let standard: Arc<dyn CounterStore> = Arc::new(RedisStore::connect(&standard_settings).await?);
        let standard = PipelineBatcher::spawn(standard, standard_settings.pipeline);

        let per_second = match settings.per_second_store() {
            Some(per_second_settings) => {
                let store: Arc<dyn CounterStore> =
                    Arc::new(RedisStore::connect(&per_second_settings).await?);
                Some(PipelineBatcher::spawn(store, per_second_settings.pipeline))
            }
            None => None,
        };

        Ok(Self::new(standard, per_second))
    }

    /// The pool that serves counters of `unit`.
    pub fn for_unit(&self, unit: TimeUnit) -> &PipelineBatcher {
        match (unit, &self.per_second) {
            (TimeUnit::Second, Some(per_second)) => per_second,
            _ => &self.standard,
        }
    }

    pub fn has_per_second_pool(&self) -> bool {
        self.per_second.is_some()
    }
}
