//! The unit of synchronization between a caller and a batcher.
//!
//! A produce call creates a [`PendingRequest`] / [`Completion`] pair. The
//! request (payload plus the sending half of a oneshot) is handed to the
//! batcher; the caller keeps the [`Completion`] and waits on it. Because
//! [`PendingRequest::complete`] consumes the request, the completion signal
//! can fire at most once, and the result is always written before it fires.

use crate::sink::ProduceRequest;
use crate::{CallContext, Error, Result};
use tokio::sync::oneshot;

pub struct PendingRequest {
    pub payload: ProduceRequest,
    completion: oneshot::Sender<Result<()>>,
}

impl PendingRequest {
    pub fn new(payload: ProduceRequest) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                completion: tx,
            },
            Completion { rx },
        )
    }

    pub fn item_count(&self) -> usize {
        self.payload.len()
    }

    /// Deliver the batch outcome. A caller that already gave up is ignored.
    pub fn complete(self, result: Result<()>) {
        let _ = self.completion.send(result);
    }

    /// True once the submitting call stopped waiting (canceled or expired).
    pub fn is_abandoned_by_caller(&self) -> bool {
        self.completion.is_closed()
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("items", &self.payload.len())
            .finish()
    }
}

/// The caller's half of a pending request.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl Completion {
    /// Wait for the batch outcome or for `ctx` to end, whichever comes first.
    ///
    /// Returning on `ctx` does not withdraw the request: the batcher still
    /// flushes it and its result is discarded. If the batcher drops the
    /// request without completing it, the caller gets [`Error::Abandoned`].
    pub async fn wait(self, ctx: &CallContext) -> Result<()> {
        tokio::select! {
            biased;
            res = self.rx => res.unwrap_or(Err(Error::Abandoned)),
            err = ctx.done() => Err(err),
        }
    }
}
