//! Request coalescing strategies.
//!
//! Every strategy implements the same contract: a caller hands over a
//! [`ProduceRequest`], the batcher folds it into a batch together with
//! whatever else is pending, makes exactly one [`Sink`] call for that batch
//! and fans the single outcome out to every request in it (shared fate).
//!
//! ```text
//!   callers ──► enqueue ──► buffer ──► flush ──► Sink::produce_items
//!                 │                      │
//!                 └── wait(ctx) ◄────────┘ one result, cloned per request
//! ```
//!
//! | Strategy | Buffer owner | Flush trigger |
//! |----------|--------------|---------------|
//! | [`LockBatcher`] | mutex holder | size threshold, or periodic timer |
//! | [`ActorBatcher`] | owner task | periodic timer only |
//! | [`GreedyDrainBatcher`] | owner task | every wakeup, drains the mailbox |
//! | [`GreedyDrainNoAllocBatcher`] | owner task | same, with reused fixed buffers |
//!
//! No strategy ever has two sink calls in flight for the same instance: the
//! lock strategy flushes only while holding its lock, the others flush only
//! from their single owner task.

mod actor;
mod config;
mod greedy;
mod greedy_noalloc;
mod lock;
mod stats;

pub use actor::ActorBatcher;
pub use config::{BatcherConfig, ClosePolicy};
pub use greedy::GreedyDrainBatcher;
pub use greedy_noalloc::GreedyDrainNoAllocBatcher;
pub use lock::LockBatcher;
pub use stats::{BatcherStats, StatsSnapshot};

use crate::request::PendingRequest;
use crate::sink::{ProduceRequest, Sink};
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A request-coalescing strategy.
#[async_trait]
pub trait Batcher: Send + Sync {
    /// Short strategy name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Submit `request` and wait for the outcome of the batch it lands in,
    /// or for `ctx` to end. Once enqueued a request cannot be withdrawn.
    ///
    /// The ctx is checked before enqueueing: a call whose ctx has already
    /// been canceled or has expired returns that error and its items never
    /// reach the sink.
    async fn produce_items(&self, ctx: &CallContext, request: ProduceRequest) -> Result<()>;

    /// Stop the background task(s) and wait for them to exit. Idempotent.
    async fn close(&self) -> Result<()>;

    fn stats(&self) -> StatsSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Lock,
    Actor,
    GreedyDrain,
    GreedyDrainNoAlloc,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Lock,
        Strategy::Actor,
        Strategy::GreedyDrain,
        Strategy::GreedyDrainNoAlloc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Lock => "lock",
            Strategy::Actor => "actor",
            Strategy::GreedyDrain => "greedy-drain",
            Strategy::GreedyDrainNoAlloc => "greedy-drain-noalloc",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("unknown strategy '{}'", s),
                    ErrorContext::new()
                        .with_details("expected one of: lock, actor, greedy-drain, greedy-drain-noalloc"),
                )
            })
    }
}

/// Build and start a batcher for `strategy`. Must be called inside a tokio runtime.
pub fn spawn_batcher(
    strategy: Strategy,
    config: BatcherConfig,
    sink: Arc<dyn Sink>,
) -> Result<Box<dyn Batcher>> {
    Ok(match strategy {
        Strategy::Lock => Box::new(LockBatcher::new(config, sink)?),
        Strategy::Actor => Box::new(ActorBatcher::new(config, sink)?),
        Strategy::GreedyDrain => Box::new(GreedyDrainBatcher::new(config, sink)?),
        Strategy::GreedyDrainNoAlloc => Box::new(GreedyDrainNoAllocBatcher::new(config, sink)?),
    })
}

/// Sink call discipline shared by every strategy.
pub(crate) struct Flusher {
    sink: Arc<dyn Sink>,
    timeout: Duration,
    stats: Arc<BatcherStats>,
    name: &'static str,
}

impl Flusher {
    pub(crate) fn new(
        name: &'static str,
        sink: Arc<dyn Sink>,
        timeout: Duration,
        stats: Arc<BatcherStats>,
    ) -> Self {
        Self {
            sink,
            timeout,
            stats,
            name,
        }
    }

    /// Send `batch` once under the fixed flush deadline and hand the single
    /// result to every request. No sink call is made for zero requests.
    pub(crate) async fn flush<I>(&self, batch: &ProduceRequest, requests: I)
    where
        I: ExactSizeIterator<Item = PendingRequest>,
    {
        let count = requests.len();
        if count == 0 {
            return;
        }

        let start = Instant::now();
        let result = self.send(batch).await;
        self.stats.record_batch(count, batch.len(), result.is_ok());

        match &result {
            Ok(()) => tracing::debug!(
                batcher = self.name,
                requests = count,
                items = batch.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "flushed batch"
            ),
            Err(e) => tracing::warn!(
                batcher = self.name,
                requests = count,
                items = batch.len(),
                error = %e,
                "batch failed; failing every request in it"
            ),
        }

        for req in requests {
            req.complete(result.clone());
        }
    }

    /// Concatenate and flush an owned list of requests.
    pub(crate) async fn flush_all(&self, requests: Vec<PendingRequest>) {
        let batch = concat(&requests);
        self.flush(&batch, requests.into_iter()).await;
    }

    async fn send(&self, batch: &ProduceRequest) -> Result<()> {
        let ctx = CallContext::with_timeout(self.timeout);
        match tokio::time::timeout(self.timeout, self.sink.produce_items(&ctx, batch)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Close-time handling of requests still queued.
    pub(crate) async fn settle_on_close(&self, policy: ClosePolicy, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }
        match policy {
            ClosePolicy::Flush => {
                tracing::debug!(
                    batcher = self.name,
                    requests = requests.len(),
                    "flushing queued requests on close"
                );
                self.flush_all(requests).await;
            }
            ClosePolicy::Abandon => {
                tracing::warn!(
                    batcher = self.name,
                    requests = requests.len(),
                    "abandoning queued requests on close"
                );
                self.stats.record_abandoned(requests.len());
            }
        }
    }
}

/// Batch payload for `requests`, in the order they were incorporated.
pub(crate) fn concat(requests: &[PendingRequest]) -> ProduceRequest {
    let items = requests.iter().map(|r| r.payload.len()).sum();
    let mut batch = ProduceRequest::with_capacity(items);
    for req in requests {
        batch.extend_from(&req.payload);
    }
    batch
}

/// Receiving side of an owner task's mailbox.
pub(crate) trait Mailbox {
    /// Refuse further sends while keeping buffered requests readable.
    fn close(&mut self);

    fn try_recv(&mut self) -> Option<PendingRequest>;

    /// Close and take everything still buffered.
    fn drain_closed(&mut self, into: &mut Vec<PendingRequest>) {
        self.close();
        while let Some(req) = self.try_recv() {
            into.push(req);
        }
    }
}

impl Mailbox for mpsc::Receiver<PendingRequest> {
    fn close(&mut self) {
        mpsc::Receiver::close(self);
    }

    fn try_recv(&mut self) -> Option<PendingRequest> {
        mpsc::Receiver::try_recv(self).ok()
    }
}

impl Mailbox for mpsc::UnboundedReceiver<PendingRequest> {
    fn close(&mut self) {
        mpsc::UnboundedReceiver::close(self);
    }

    fn try_recv(&mut self) -> Option<PendingRequest> {
        mpsc::UnboundedReceiver::try_recv(self).ok()
    }
}

/// Hand `req` to a bounded mailbox, giving up if `ctx` ends first.
pub(crate) async fn enqueue_bounded(
    mailbox: &mpsc::Sender<PendingRequest>,
    ctx: &CallContext,
    req: PendingRequest,
) -> Result<()> {
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        sent = mailbox.send(req) => sent.map_err(|_| Error::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, ProduceItem};

    fn request(label: &str, n: usize) -> (PendingRequest, crate::request::Completion) {
        PendingRequest::new(
            (0..n)
                .map(|i| ProduceItem::new(format!("{}-{}", label, i)))
                .collect(),
        )
    }

    #[test]
    fn test_strategy_round_trip() {
        for st in Strategy::ALL {
            assert_eq!(st.to_string().parse::<Strategy>().unwrap(), st);
        }
        assert!("spinlock".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_concat_keeps_incorporation_order() {
        let (a, _da) = request("a", 2);
        let (b, _db) = request("b", 1);
        let batch = concat(&[a, b]);
        let got: Vec<_> = batch
            .items
            .iter()
            .map(|i| String::from_utf8(i.bytes.to_vec()).unwrap())
            .collect();
        assert_eq!(got, vec!["a-0", "a-1", "b-0"]);
    }

    #[tokio::test]
    async fn test_flush_fans_out_single_result() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_call(0, MemorySink::injected_failure("whole batch"));
        let stats = Arc::new(BatcherStats::new());
        let flusher = Flusher::new("test", sink.clone(), Duration::from_secs(1), stats.clone());

        let (a, da) = request("a", 1);
        let (b, db) = request("b", 2);
        flusher.flush_all(vec![a, b]).await;

        let ctx = CallContext::background();
        let ea = da.wait(&ctx).await.unwrap_err();
        let eb = db.wait(&ctx).await.unwrap_err();
        assert_eq!(ea, eb);
        assert_eq!(sink.call_count(), 1);
        assert_eq!(stats.snapshot().sink_failures, 1);
        assert_eq!(stats.snapshot().items_sent, 3);
    }

    #[tokio::test]
    async fn test_flush_skips_empty() {
        let sink = Arc::new(MemorySink::new());
        let flusher = Flusher::new(
            "test",
            sink.clone(),
            Duration::from_secs(1),
            Arc::new(BatcherStats::new()),
        );
        flusher.flush_all(Vec::new()).await;
        assert_eq!(sink.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_deadline_is_fixed() {
        let sink = Arc::new(MemorySink::new());
        sink.pause();
        let flusher = Flusher::new(
            "test",
            sink.clone(),
            Duration::from_millis(100),
            Arc::new(BatcherStats::new()),
        );
        let (a, da) = request("a", 1);
        flusher.flush_all(vec![a]).await;
        assert_eq!(
            da.wait(&CallContext::background()).await,
            Err(Error::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_abandon_on_close_drops_requests() {
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(BatcherStats::new());
        let flusher = Flusher::new("test", sink.clone(), Duration::from_secs(1), stats.clone());
        let (a, da) = request("a", 1);
        flusher.settle_on_close(ClosePolicy::Abandon, vec![a]).await;
        assert_eq!(sink.call_count(), 0);
        assert_eq!(stats.snapshot().requests_abandoned, 1);
        assert_eq!(
            da.wait(&CallContext::background()).await,
            Err(Error::Abandoned)
        );
    }
}
