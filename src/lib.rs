//! # request-coalescer
//!
//! Strategies for coalescing many concurrent produce calls into fewer,
//! larger downstream batch calls, trading off latency, throughput and
//! allocation cost.
//!
//! ## Overview
//!
//! A caller submits a [`ProduceRequest`] through a [`Batcher`]. The batcher
//! enqueues it, eventually folds it into a batch with whatever else is
//! pending, calls the [`Sink`] once for that batch and hands the single
//! outcome to every request in it. The caller waits for its own outcome or
//! for its [`CallContext`] to end, whichever comes first.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`LockBatcher`] | Mutex-guarded buffer, threshold or periodic flush |
//! | [`ActorBatcher`] | Owner task with a bounded mailbox, periodic flush |
//! | [`GreedyDrainBatcher`] | Owner task that drains and flushes on every wakeup |
//! | [`GreedyDrainNoAllocBatcher`] | Greedy drain with reused fixed-capacity buffers |
//! | [`RepeatingTimer`](timer::RepeatingTimer) | One-shot retriggerable interval |
//! | [`HttpSink`](sink::HttpSink) | JSON-over-HTTP downstream |
//! | [`MemorySink`](sink::MemorySink) | In-process downstream for tests and benchmarks |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_coalescer::sink::{HttpSink, HttpSinkConfig, ProduceItem, ProduceRequest};
//! use request_coalescer::{spawn_batcher, BatcherConfig, CallContext, Strategy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> request_coalescer::Result<()> {
//!     let sink = Arc::new(HttpSink::new(HttpSinkConfig::without_tls("localhost:2319"))?);
//!     let batcher = spawn_batcher(Strategy::GreedyDrain, BatcherConfig::default(), sink)?;
//!
//!     let ctx = CallContext::with_timeout(Duration::from_secs(10));
//!     let request = ProduceRequest::new(vec![ProduceItem::new("hello")]);
//!     batcher.produce_items(&ctx, request).await?;
//!
//!     batcher.close().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batcher`] | The four strategies, shared flush discipline, config and stats |
//! | [`request`] | Pending request and completion protocol |
//! | [`timer`] | Retriggerable interval used by time-driven strategies |
//! | [`sink`] | Downstream sink trait and implementations |
//! | [`context`] | Caller cancellation and deadlines |

pub mod batcher;
pub mod context;
pub mod request;
pub mod sink;
pub mod timer;

pub use batcher::{
    spawn_batcher, ActorBatcher, Batcher, BatcherConfig, ClosePolicy, GreedyDrainBatcher,
    GreedyDrainNoAllocBatcher, LockBatcher, StatsSnapshot, Strategy,
};
pub use context::CallContext;
pub use sink::{ProduceItem, ProduceRequest, Sink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
