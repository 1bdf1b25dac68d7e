//! Downstream sinks: the single capability the coalescing layer consumes.
//!
//! A [`Sink`] accepts one batched [`ProduceRequest`] and reports success or
//! failure. Batchers call it at most once per flush and fan the single result
//! out to every request that was folded into the batch.
//!
//! | Sink | Description |
//! |------|-------------|
//! | [`HttpSink`] | POSTs the batch as JSON to `<endpoint>/produce` |
//! | [`MemorySink`] | In-process sink with latency, pause and failure injection |

mod http;
mod memory;

pub use http::{HttpSink, HttpSinkConfig};
pub use memory::MemorySink;

use crate::{CallContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One opaque item; the batching layer never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProduceItem {
    pub bytes: Bytes,
}

impl ProduceItem {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// An ordered sequence of items. Used both for a single caller's payload and
/// for the concatenated batch handed to the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub items: Vec<ProduceItem>,
}

impl ProduceRequest {
    pub fn new(items: Vec<ProduceItem>) -> Self {
        Self { items }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a copy of `other`'s items, preserving order.
    pub fn extend_from(&mut self, other: &ProduceRequest) {
        self.items.extend_from_slice(&other.items);
    }

    /// Drop all items but keep the allocation.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl FromIterator<ProduceItem> for ProduceRequest {
    fn from_iter<I: IntoIterator<Item = ProduceItem>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Synchronous "send a batch, get success or failure" with caller-supplied
/// cancellation. Idempotency is not assumed; nothing retries.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn produce_items(&self, ctx: &CallContext, batch: &ProduceRequest) -> Result<()>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn produce_items(&self, ctx: &CallContext, batch: &ProduceRequest) -> Result<()> {
        (**self).produce_items(ctx, batch).await
    }
}
