//! coalesce-bench: load generator that compares the coalescing strategies
//!
//! Usage:
//!   coalesce-bench [--strategy <name|all>] [--producers N] [--duration-ms N]
//!                  [--latency-ms N] [--batch-limit N]
//!
//! Batcher settings not given on the command line come from `COALESCE_*`
//! environment variables. Log output follows `RUST_LOG`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use request_coalescer::sink::MemorySink;
use request_coalescer::{
    spawn_batcher, BatcherConfig, CallContext, ProduceItem, ProduceRequest, StatsSnapshot,
    Strategy,
};
use tracing_subscriber::EnvFilter;

struct Options {
    strategies: Vec<Strategy>,
    producers: usize,
    duration: Duration,
    latency: Duration,
    batch_limit: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            strategies: Strategy::ALL.to_vec(),
            producers: 64,
            duration: Duration::from_secs(2),
            latency: Duration::from_millis(1),
            batch_limit: None,
        }
    }
}

struct RunReport {
    strategy: Strategy,
    ok: u64,
    failed: u64,
    elapsed: Duration,
    stats: StatsSnapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h" || a == "help") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("coalesce-bench {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let options = parse_args(&args)?;
    let mut config = BatcherConfig::from_env().context("reading COALESCE_* environment")?;
    if let Some(limit) = options.batch_limit {
        config = config.with_batch_limit(limit);
    }
    config.validate()?;

    println!(
        "{:<22} {:>12} {:>10} {:>10} {:>12}",
        "strategy", "ops/s", "failed", "batches", "avg batch"
    );
    for strategy in &options.strategies {
        let report = run_one(*strategy, &options, config.clone()).await?;
        let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "{:<22} {:>12.0} {:>10} {:>10} {:>12.1}",
            report.strategy.as_str(),
            report.ok as f64 / secs,
            report.failed,
            report.stats.batches_sent,
            report.stats.avg_batch_size(),
        );
    }
    Ok(())
}

fn print_usage() {
    println!(
        r#"coalesce-bench: compare request coalescing strategies against an in-memory sink

USAGE:
    coalesce-bench [OPTIONS]

OPTIONS:
    --strategy <name|all>   lock, actor, greedy-drain, greedy-drain-noalloc (default: all)
    --producers <N>         Concurrent producer tasks (default: 64)
    --duration-ms <N>       How long each strategy runs (default: 2000)
    --latency-ms <N>        Simulated sink latency per call (default: 1)
    --batch-limit <N>       Overrides COALESCE_BATCH_LIMIT
    --version               Show version information
    --help                  Show this help message

ENVIRONMENT:
    COALESCE_BATCH_LIMIT, COALESCE_FLUSH_INTERVAL_MS, COALESCE_FLUSH_TIMEOUT_MS,
    COALESCE_MAILBOX_CAPACITY, COALESCE_DRAIN_CAPACITY, COALESCE_ON_CLOSE
    RUST_LOG                Log filter (default: warn)"#
    );
}

fn parse_args(args: &[String]) -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .with_context(|| format!("missing value for {flag}"))
        };
        match flag.as_str() {
            "--strategy" => {
                let name = value()?;
                options.strategies = if name == "all" {
                    Strategy::ALL.to_vec()
                } else {
                    vec![name.parse()?]
                };
            }
            "--producers" => options.producers = parse_number(flag, value()?)?,
            "--duration-ms" => {
                options.duration = Duration::from_millis(parse_number(flag, value()?)?)
            }
            "--latency-ms" => {
                options.latency = Duration::from_millis(parse_number(flag, value()?)?)
            }
            "--batch-limit" => options.batch_limit = Some(parse_number(flag, value()?)?),
            other => bail!("unknown option: {other} (see --help)"),
        }
    }
    if options.producers == 0 {
        bail!("--producers must be at least 1");
    }
    Ok(options)
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> anyhow::Result<T> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{flag} expects a number, got {raw:?}"))
}

async fn run_one(
    strategy: Strategy,
    options: &Options,
    config: BatcherConfig,
) -> anyhow::Result<RunReport> {
    let sink = Arc::new(MemorySink::with_latency(options.latency).without_recording());
    let batcher: Arc<dyn request_coalescer::Batcher> =
        Arc::from(spawn_batcher(strategy, config, sink)?);
    let ok = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let deadline = started + options.duration;

    let producers = (0..options.producers).map(|p| {
        let batcher = batcher.clone();
        let ok = ok.clone();
        let failed = failed.clone();
        tokio::spawn(async move {
            let ctx = CallContext::background();
            let mut seq = 0u64;
            while Instant::now() < deadline {
                let item = ProduceItem::new(format!("{p}-{seq}"));
                seq += 1;
                match batcher
                    .produce_items(&ctx, ProduceRequest::new(vec![item]))
                    .await
                {
                    Ok(()) => ok.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        })
    });
    for joined in futures::future::join_all(producers).await {
        joined.context("producer task panicked")?;
    }
    let elapsed = started.elapsed();

    batcher.close().await?;
    tracing::info!(strategy = %strategy, ?elapsed, "run finished");
    Ok(RunReport {
        strategy,
        ok: ok.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        elapsed,
        stats: batcher.stats(),
    })
}
