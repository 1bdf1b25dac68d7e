//! Single owner task with a periodic flush.
//!
//! Producers hand requests to a bounded mailbox (capacity = batch limit) and
//! block when it is full. The owner task moves arrivals into a local buffer
//! and flushes that buffer on every timer fire, so no request is sent sooner
//! than the next tick regardless of load.

use super::{enqueue_bounded, Batcher, BatcherConfig, BatcherStats, Flusher, Mailbox, StatsSnapshot};
use crate::request::PendingRequest;
use crate::sink::{ProduceRequest, Sink};
use crate::timer::RepeatingTimer;
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ActorBatcher {
    mailbox: mpsc::Sender<PendingRequest>,
    stats: Arc<BatcherStats>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActorBatcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(BatcherStats::new());
        let (tx, rx) = mpsc::channel(config.actor_mailbox_capacity());
        let flusher = Flusher::new("actor", sink, config.flush_timeout, stats.clone());
        let shutdown = CancellationToken::new();

        tracing::info!(
            batcher = "actor",
            mailbox = config.actor_mailbox_capacity(),
            interval_ms = config.flush_interval.as_millis() as u64,
            "batcher started"
        );
        let worker = tokio::spawn(run(rx, flusher, shutdown.clone(), config));

        Ok(Self {
            mailbox: tx,
            stats,
            closed: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }
}

async fn run(
    mut rx: mpsc::Receiver<PendingRequest>,
    flusher: Flusher,
    shutdown: CancellationToken,
    config: BatcherConfig,
) {
    let limit = config.batch_limit;
    let mut buffer: Vec<PendingRequest> = Vec::with_capacity(limit);
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
                let requests = std::mem::replace(&mut buffer, Vec::with_capacity(limit));
                flusher.flush_all(requests).await;
                timer.arm();
            }
            req = rx.recv() => match req {
                Some(req) => buffer.push(req),
                None => break,
            },
        }
    }
    timer.stop().await;

    rx.drain_closed(&mut buffer);
    flusher.settle_on_close(config.on_close, buffer).await;
}

#[async_trait]
impl Batcher for ActorBatcher {
    fn name(&self) -> &'static str {
        "actor"
    }

    async fn produce_items(&self, ctx: &CallContext, request: ProduceRequest) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (req, done) = PendingRequest::new(request);
        enqueue_bounded(&self.mailbox, ctx, req).await?;
        self.stats.record_received();
        done.wait(ctx).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            worker.await.map_err(|e| {
                Error::runtime_with_context(
                    format!("owner task failed: {}", e),
                    ErrorContext::new().with_source("actor_batcher"),
                )
            })?;
            tracing::info!(batcher = "actor", "batcher closed");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ActorBatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
