//! Single owner task that flushes on every wakeup.
//!
//! The owner blocks until one request arrives, then drains everything else
//! already queued and flushes immediately. Under light load that is close
//! to one request per call; under sustained load batches grow on their own
//! because more requests pile up while the previous flush is in flight.

use super::{Batcher, BatcherConfig, BatcherStats, Flusher, Mailbox, StatsSnapshot};
use crate::request::PendingRequest;
use crate::sink::{ProduceRequest, Sink};
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct GreedyDrainBatcher {
    mailbox: mpsc::UnboundedSender<PendingRequest>,
    stats: Arc<BatcherStats>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GreedyDrainBatcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(BatcherStats::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = Flusher::new("greedy-drain", sink, config.flush_timeout, stats.clone());
        let shutdown = CancellationToken::new();

        tracing::info!(batcher = "greedy-drain", "batcher started");
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
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
    flusher: Flusher,
    shutdown: CancellationToken,
    config: BatcherConfig,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let mut requests = vec![first];
        let mut batch = ProduceRequest::default();
        batch.extend_from(&requests[0].payload);
        while let Ok(req) = rx.try_recv() {
            batch.extend_from(&req.payload);
            requests.push(req);
        }

        flusher.flush(&batch, requests.into_iter()).await;
    }

    let mut remaining = Vec::new();
    rx.drain_closed(&mut remaining);
    flusher.settle_on_close(config.on_close, remaining).await;
}

#[async_trait]
impl Batcher for GreedyDrainBatcher {
    fn name(&self) -> &'static str {
        "greedy-drain"
    }

    async fn produce_items(&self, ctx: &CallContext, request: ProduceRequest) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let (req, done) = PendingRequest::new(request);
        self.mailbox.send(req).map_err(|_| Error::Closed)?;
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
                    ErrorContext::new().with_source("greedy_drain_batcher"),
                )
            })?;
            tracing::info!(batcher = "greedy-drain", "batcher closed");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for GreedyDrainBatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
