//! Mutex-guarded shared buffer.
//!
//! Producers append under the lock. The producer whose append reaches the
//! batch limit hands the still-held lock to a detached flush task, so no
//! other producer can append until the sink call returns. A background task
//! flushes whatever is buffered on every timer fire.
//!
//! The flush task owns the guard, not the triggering caller: dropping that
//! caller's future only discards its own result.

use super::{Batcher, BatcherConfig, BatcherStats, Flusher, StatsSnapshot};
use crate::request::PendingRequest;
use crate::sink::{ProduceRequest, Sink};
use crate::timer::RepeatingTimer;
use crate::{CallContext, Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Shared {
    buffer: Arc<Mutex<Vec<PendingRequest>>>,
    flusher: Flusher,
    limit: usize,
    closed: AtomicBool,
}

impl Shared {
    /// Flush and replace the buffer. Caller holds the lock.
    async fn flush_locked(&self, buffer: &mut Vec<PendingRequest>) {
        if buffer.is_empty() {
            return;
        }
        let requests = std::mem::replace(buffer, Vec::with_capacity(self.limit));
        self.flusher.flush_all(requests).await;
    }
}

pub struct LockBatcher {
    shared: Arc<Shared>,
    stats: Arc<BatcherStats>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LockBatcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(BatcherStats::new());
        let shared = Arc::new(Shared {
            buffer: Arc::new(Mutex::new(Vec::with_capacity(config.batch_limit))),
            flusher: Flusher::new("lock", sink, config.flush_timeout, stats.clone()),
            limit: config.batch_limit,
            closed: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(run(shared.clone(), shutdown.clone(), config));
        tracing::info!(batcher = "lock", limit = shared.limit, "batcher started");

        Ok(Self {
            shared,
            stats,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }
}

async fn run(shared: Arc<Shared>, shutdown: CancellationToken, config: BatcherConfig) {
    let mut timer = RepeatingTimer::new(config.flush_interval);
    timer.arm();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            fired = timer.fired() => {
                if fired.is_none() {
                    break;
                }
                let mut buffer = shared.buffer.lock().await;
                shared.flush_locked(&mut buffer).await;
                drop(buffer);
                timer.arm();
            }
        }
    }
    timer.stop().await;

    // Settle while holding the lock so no producer interleaves.
    let mut buffer = shared.buffer.lock().await;
    let remaining = std::mem::take(&mut *buffer);
    shared
        .flusher
        .settle_on_close(config.on_close, remaining)
        .await;
}

#[async_trait]
impl Batcher for LockBatcher {
    fn name(&self) -> &'static str {
        "lock"
    }

    async fn produce_items(&self, ctx: &CallContext, request: ProduceRequest) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (req, done) = PendingRequest::new(request);

        {
            let mut buffer = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                buffer = self.shared.buffer.clone().lock_owned() => buffer,
            };
            // Re-check under the lock: the close path takes it last.
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            buffer.push(req);
            self.stats.record_received();
            if buffer.len() >= self.shared.limit {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    let mut buffer = buffer;
                    shared.flush_locked(&mut buffer).await;
                });
            }
        }

        done.wait(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            worker.await.map_err(|e| {
                Error::runtime_with_context(
                    format!("flusher task failed: {}", e),
                    crate::ErrorContext::new().with_source("lock_batcher"),
                )
            })?;
            tracing::info!(batcher = "lock", "batcher closed");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for LockBatcher {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}
