//! Greedy drain with buffers reused across cycles.
//!
//! Same behavior as [`GreedyDrainBatcher`](super::GreedyDrainBatcher), but
//! the owner task allocates its request buffer and batch payload once and
//! resets their length after each flush. The request buffer has a hard
//! capacity: the mailbox is bounded for backpressure, and the drain loop
//! stops when the buffer is full, leaving the rest for the next cycle.

use super::{enqueue_bounded, Batcher, BatcherConfig, BatcherStats, Flusher, Mailbox, StatsSnapshot};
use crate::request::PendingRequest;
use crate::sink::{ProduceRequest, Sink};
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fixed-capacity request buffer plus its concatenated payload.
pub(crate) struct DrainBuffer {
    requests: Vec<PendingRequest>,
    batch: ProduceRequest,
    capacity: usize,
}

impl DrainBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
            batch: ProduceRequest::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.requests.len() >= self.capacity
    }

    /// Add a request. Past the high-water mark the request is rejected and
    /// completed with `CapacityExceeded` instead of growing the buffer.
    pub(crate) fn push(&mut self, req: PendingRequest) -> Result<()> {
        if self.is_full() {
            let err = Error::CapacityExceeded {
                len: self.requests.len() + 1,
                capacity: self.capacity,
            };
            tracing::error!(capacity = self.capacity, "drain buffer overflow rejected");
            req.complete(Err(err.clone()));
            return Err(err);
        }
        self.batch.extend_from(&req.payload);
        self.requests.push(req);
        Ok(())
    }

    /// Flush and reset length to zero, keeping both allocations.
    pub(crate) async fn flush(&mut self, flusher: &Flusher) {
        flusher.flush(&self.batch, self.requests.drain(..)).await;
        self.batch.clear();
    }

    fn take_all(&mut self) -> Vec<PendingRequest> {
        self.batch.clear();
        self.requests.drain(..).collect()
    }
}

pub struct GreedyDrainNoAllocBatcher {
    mailbox: mpsc::Sender<PendingRequest>,
    stats: Arc<BatcherStats>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GreedyDrainNoAllocBatcher {
    pub fn new(config: BatcherConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(BatcherStats::new());
        let (tx, rx) = mpsc::channel(config.drain_mailbox_capacity());
        let flusher = Flusher::new(
            "greedy-drain-noalloc",
            sink,
            config.flush_timeout,
            stats.clone(),
        );
        let shutdown = CancellationToken::new();

        tracing::info!(
            batcher = "greedy-drain-noalloc",
            mailbox = config.drain_mailbox_capacity(),
            drain_capacity = config.drain_capacity,
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
    let mut buffer = DrainBuffer::new(config.drain_capacity);

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        // The buffer is empty here, so the first push cannot overflow.
        let _ = buffer.push(first);
        while !buffer.is_full() {
            match rx.try_recv() {
                Ok(req) => {
                    let _ = buffer.push(req);
                }
                Err(_) => break,
            }
        }
        if buffer.is_full() {
            tracing::debug!(
                batcher = "greedy-drain-noalloc",
                requests = buffer.len(),
                "drain stopped at buffer capacity"
            );
        }

        buffer.flush(&flusher).await;
    }

    let mut remaining = buffer.take_all();
    rx.drain_closed(&mut remaining);
    // Close-time leftovers go out in capacity-sized chunks.
    while !remaining.is_empty() {
        let rest = remaining.split_off(remaining.len().min(config.drain_capacity));
        flusher.settle_on_close(config.on_close, remaining).await;
        remaining = rest;
    }
}

#[async_trait]
impl Batcher for GreedyDrainNoAllocBatcher {
    fn name(&self) -> &'static str {
        "greedy-drain-noalloc"
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
                    ErrorContext::new().with_source("greedy_drain_noalloc_batcher"),
                )
            })?;
            tracing::info!(batcher = "greedy-drain-noalloc", "batcher closed");
        }
        Ok(())
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for GreedyDrainNoAllocBatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, ProduceItem};
    use std::time::Duration;

    fn one(label: &str) -> ProduceRequest {
        ProduceRequest::new(vec![ProduceItem::new(label.to_string())])
    }

    #[tokio::test]
    async fn test_buffer_rejects_past_capacity() {
        let mut buffer = DrainBuffer::new(2);
        let (a, _da) = PendingRequest::new(one("a"));
        let (b, _db) = PendingRequest::new(one("b"));
        let (c, dc) = PendingRequest::new(one("c"));
        buffer.push(a).unwrap();
        buffer.push(b).unwrap();
        assert!(buffer.is_full());

        let err = buffer.push(c).unwrap_err();
        assert_eq!(err, Error::CapacityExceeded { len: 3, capacity: 2 });
        assert_eq!(buffer.len(), 2);
        assert_eq!(
            dc.wait(&CallContext::background()).await,
            Err(Error::CapacityExceeded { len: 3, capacity: 2 })
        );
    }

    #[tokio::test]
    async fn test_flush_keeps_allocations() {
        let sink = Arc::new(MemorySink::new());
        let flusher = Flusher::new(
            "test",
            sink.clone(),
            Duration::from_secs(1),
            Arc::new(BatcherStats::new()),
        );
        let mut buffer = DrainBuffer::new(4);
        let cap = buffer.requests.capacity();
        let (a, da) = PendingRequest::new(one("a"));
        buffer.push(a).unwrap();
        buffer.flush(&flusher).await;

        assert_eq!(buffer.len(), 0);
        assert!(buffer.batch.is_empty());
        assert_eq!(buffer.requests.capacity(), cap);
        assert!(da.wait(&CallContext::background()).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_never_exceeds_capacity() {
        let sink = Arc::new(MemorySink::new());
        sink.pause();
        let config = BatcherConfig::new()
            .with_batch_limit(4)
            .with_drain_capacity(4);
        let batcher = Arc::new(GreedyDrainNoAllocBatcher::new(config, sink.clone()).unwrap());

        let mut handles = Vec::new();
        for i in 0..18 {
            let b = batcher.clone();
            handles.push(tokio::spawn(async move {
                b.produce_items(&CallContext::background(), one(&format!("r{}", i)))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        sink.resume();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(sink.item_count(), 18);
        assert!(sink.batches().iter().all(|b| b.len() <= 4));
        assert!(batcher.stats().largest_batch <= 4);
        batcher.close().await.unwrap();
    }
}
