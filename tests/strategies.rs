//! Behavior every coalescing strategy must share.

use request_coalescer::sink::MemorySink;
use request_coalescer::{
    spawn_batcher, Batcher, BatcherConfig, CallContext, ClosePolicy, Error, ProduceItem,
    ProduceRequest, Strategy,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config() -> BatcherConfig {
    BatcherConfig::new()
        .with_batch_limit(16)
        .with_flush_interval(Duration::from_millis(5))
        .with_drain_capacity(16)
}

fn single(label: String) -> ProduceRequest {
    ProduceRequest::new(vec![ProduceItem::new(label)])
}

fn start(strategy: Strategy, config: BatcherConfig, sink: &Arc<MemorySink>) -> Arc<dyn Batcher> {
    Arc::from(spawn_batcher(strategy, config, sink.clone()).expect("valid config"))
}

async fn submit_concurrently(
    batcher: &Arc<dyn Batcher>,
    n: usize,
    timeout: Duration,
) -> Vec<Result<(), Error>> {
    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let b = batcher.clone();
        handles.push(tokio::spawn(async move {
            b.produce_items(&CallContext::with_timeout(timeout), single(format!("item-{}", i)))
                .await
        }));
    }
    let mut results = Vec::with_capacity(n);
    for h in handles {
        results.push(h.await.expect("producer task panicked"));
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_loss_no_duplication() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::new());
        let batcher = start(strategy, test_config(), &sink);

        let results = submit_concurrently(&batcher, 200, Duration::from_secs(5)).await;
        assert!(
            results.iter().all(|r| r.is_ok()),
            "{}: every request should succeed",
            strategy
        );

        let mut seen: HashMap<String, usize> = HashMap::new();
        for batch in sink.batches() {
            for item in batch.items {
                *seen
                    .entry(String::from_utf8(item.bytes.to_vec()).unwrap())
                    .or_default() += 1;
            }
        }
        assert_eq!(seen.len(), 200, "{}: missing items", strategy);
        assert!(seen.values().all(|&c| c == 1), "{}: duplicated items", strategy);

        let stats = batcher.stats();
        assert_eq!(stats.requests_received, 200);
        assert_eq!(stats.requests_completed, 200);
        batcher.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_shared_fate_within_one_batch() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::new());
        let injected = MemorySink::injected_failure("first batch");
        sink.fail_call(0, injected.clone());
        let batcher = start(strategy, test_config(), &sink);

        let results = submit_concurrently(&batcher, 40, Duration::from_secs(5)).await;
        let failed: Vec<_> = results.iter().filter_map(|r| r.clone().err()).collect();

        let first_batch = sink.batches()[0].len();
        assert_eq!(failed.len(), first_batch, "{}", strategy);
        assert!(failed.iter().all(|e| *e == injected), "{}", strategy);
        assert_eq!(
            results.iter().filter(|r| r.is_ok()).count(),
            40 - first_batch,
            "{}: other batches must be unaffected",
            strategy
        );
        assert_eq!(batcher.stats().sink_failures, 1);
        batcher.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_flush_in_flight() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::with_latency(Duration::from_millis(3)));
        let config = test_config().with_batch_limit(4).with_drain_capacity(4);
        let batcher = start(strategy, config, &sink);

        let results = submit_concurrently(&batcher, 120, Duration::from_secs(10)).await;
        assert!(results.iter().all(|r| r.is_ok()), "{}", strategy);
        assert!(!sink.saw_overlap(), "{}: concurrent sink calls", strategy);
        batcher.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_lock_threshold_and_timer_flush() {
    let sink = Arc::new(MemorySink::new());
    let config = BatcherConfig::new()
        .with_batch_limit(2)
        .with_flush_interval(Duration::from_millis(15));
    let batcher = start(Strategy::Lock, config, &sink);

    let results = submit_concurrently(&batcher, 2, Duration::from_secs(1)).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(sink.call_count(), 1);
    assert_eq!(sink.batches()[0].len(), 2);

    sink.clear();
    batcher
        .produce_items(
            &CallContext::with_timeout(Duration::from_secs(1)),
            single("alone".into()),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(sink.call_count(), 1);
    assert_eq!(sink.batches()[0].len(), 1);
    batcher.close().await.unwrap();
}

#[tokio::test]
async fn test_greedy_coalesces_simultaneous_burst() {
    let sink = Arc::new(MemorySink::new());
    sink.pause();
    let batcher = start(Strategy::GreedyDrain, BatcherConfig::default(), &sink);

    let pending = {
        let batcher = batcher.clone();
        tokio::spawn(async move { submit_concurrently(&batcher, 50, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    sink.resume();

    let results = pending.await.unwrap();
    assert!(results.iter().all(|r| r.is_ok()));
    let sizes: Vec<_> = sink.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![50]);
    batcher.close().await.unwrap();
}

#[tokio::test]
async fn test_expired_deadline_is_independent() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::with_latency(Duration::from_millis(20)));
        let batcher = start(strategy, test_config(), &sink);

        let others = {
            let batcher = batcher.clone();
            tokio::spawn(async move { submit_concurrently(&batcher, 10, Duration::from_secs(5)).await })
        };

        let expired = CallContext::with_deadline(tokio::time::Instant::now());
        let started = Instant::now();
        let err = batcher
            .produce_items(&expired, single("late".into()))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DeadlineExceeded, "{}", strategy);
        assert!(started.elapsed() < Duration::from_millis(200), "{}", strategy);

        let results = others.await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()), "{}", strategy);
        batcher.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_idle_close_is_prompt() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::new());
        let batcher = start(strategy, BatcherConfig::default(), &sink);
        tokio::time::timeout(Duration::from_secs(1), batcher.close())
            .await
            .unwrap_or_else(|_| panic!("{}: close did not return", strategy))
            .unwrap();
        assert_eq!(sink.call_count(), 0);

        let err = batcher
            .produce_items(&CallContext::background(), single("after".into()))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Closed, "{}", strategy);
    }
}

#[tokio::test]
async fn test_close_flushes_queued_requests_by_default() {
    let sink = Arc::new(MemorySink::new());
    let config = BatcherConfig::new().with_flush_interval(Duration::from_secs(3600));
    let batcher = start(Strategy::Actor, config, &sink);

    let waiter = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            batcher
                .produce_items(&CallContext::background(), single("queued".into()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    batcher.close().await.unwrap();

    assert_eq!(waiter.await.unwrap(), Ok(()));
    assert_eq!(sink.item_count(), 1);
}

#[tokio::test]
async fn test_abandon_policy_releases_waiters() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::new());
        sink.pause();
        let config = BatcherConfig::new()
            .with_flush_interval(Duration::from_secs(3600))
            .with_drain_capacity(1)
            .with_close_policy(ClosePolicy::Abandon);
        let batcher = start(strategy, config, &sink);

        // Greedy strategies send the first request at once and stall on the
        // paused sink; the rest stay queued behind it.
        let mut waiters = Vec::new();
        for label in ["first", "stranded-1", "stranded-2"] {
            let batcher = batcher.clone();
            waiters.push(tokio::spawn(async move {
                batcher
                    .produce_items(&CallContext::background(), single(label.into()))
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let closing = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.resume();
        closing.await.unwrap().unwrap();

        let mut results = Vec::new();
        for waiter in waiters {
            let res = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter must not block forever")
                .unwrap();
            results.push(res);
        }
        assert_eq!(results[1], Err(Error::Abandoned), "{}", strategy);
        assert_eq!(results[2], Err(Error::Abandoned), "{}", strategy);

        let sent = sink.call_count();
        match strategy {
            Strategy::GreedyDrain | Strategy::GreedyDrainNoAlloc => {
                assert_eq!(sent, 1, "{}", strategy);
                assert_eq!(results[0], Ok(()), "{}", strategy);
            }
            Strategy::Lock | Strategy::Actor => {
                assert_eq!(sent, 0, "{}", strategy);
                assert_eq!(results[0], Err(Error::Abandoned), "{}", strategy);
            }
        }
        assert_eq!(
            batcher.stats().requests_abandoned,
            (3 - sent) as u64,
            "{}",
            strategy
        );
    }
}

#[tokio::test]
async fn test_ended_context_never_reaches_sink() {
    for strategy in Strategy::ALL {
        let sink = Arc::new(MemorySink::new());
        let batcher = start(strategy, test_config(), &sink);

        let ctx = CallContext::background();
        ctx.cancel();
        let err = batcher
            .produce_items(&ctx, single("gone".into()))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Canceled, "{}", strategy);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.call_count(), 0, "{}", strategy);
        assert_eq!(batcher.stats().requests_received, 0, "{}", strategy);
        batcher.close().await.unwrap();
    }
}
