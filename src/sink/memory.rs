use super::{ProduceRequest, Sink};
use crate::{CallContext, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// In-process sink that records every batch it receives.
///
/// - Optional per-call latency
/// - `pause()`/`resume()` gate to hold calls while load piles up
/// - Failure injection by call index, or for every call
/// - Detects overlapping calls (two batches in flight at once)
pub struct MemorySink {
    batches: Mutex<Vec<ProduceRequest>>,
    failures: Mutex<HashMap<usize, Error>>,
    fail_always: Mutex<Option<Error>>,
    calls: AtomicUsize,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
    latency: Duration,
    record: bool,
    paused: watch::Sender<bool>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Sleep `latency` inside every call, like a remote that does real work.
    pub fn with_latency(latency: Duration) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            batches: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            fail_always: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            latency,
            record: true,
            paused,
        }
    }

    /// Count calls without keeping batch copies, for long benchmark runs.
    pub fn without_recording(mut self) -> Self {
        self.record = false;
        self
    }

    /// Fail the `index`-th call (zero based) with `error`.
    pub fn fail_call(&self, index: usize, error: Error) {
        self.failures.lock().unwrap().insert(index, error);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn fail_always(&self, error: Option<Error>) {
        *self.fail_always.lock().unwrap() = error;
    }

    /// Hold every call (after it is recorded) until `resume()`.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn batches(&self) -> Vec<ProduceRequest> {
        self.batches.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Items across recorded batches. Zero after `without_recording()`.
    pub fn item_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }

    /// True if two calls were ever in flight at the same time.
    pub fn saw_overlap(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.batches.lock().unwrap().clear();
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn produce_items(&self, ctx: &CallContext, batch: &ProduceRequest) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.record {
            self.batches.lock().unwrap().push(batch.clone());
        }

        let mut paused = self.paused.subscribe();
        let work = async {
            // The sender lives in `self`, so the watch cannot close here.
            let _ = paused.wait_for(|p| !*p).await;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        };
        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            _ = work => {}
        }

        if let Some(err) = self.failures.lock().unwrap().remove(&index) {
            return Err(err);
        }
        if let Some(err) = self.fail_always.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(())
    }
}

impl MemorySink {
    /// Convenience error for failure-injection tests.
    pub fn injected_failure(label: &str) -> Error {
        Error::sink_with_context(
            "injected failure",
            ErrorContext::new()
                .with_details(label)
                .with_source("memory_sink"),
        )
    }
}
