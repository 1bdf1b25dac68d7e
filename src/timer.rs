//! One-shot, retriggerable interval.
//!
//! Unlike `tokio::time::interval`, a [`RepeatingTimer`] only fires after an
//! explicit [`arm`](RepeatingTimer::arm). Arms that arrive while one is
//! already buffered are dropped, so slow consumers never build a backlog of
//! ticks: intervals are coalesced, not queued.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RepeatingTimer {
    arm_tx: mpsc::Sender<()>,
    fire_rx: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl RepeatingTimer {
    /// Spawn the timer worker. Must be called inside a tokio runtime.
    pub fn new(period: Duration) -> Self {
        let (arm_tx, mut arm_rx) = mpsc::channel::<()>(1);
        let (fire_tx, fire_rx) = mpsc::channel::<()>(1);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    armed = arm_rx.recv() => {
                        if armed.is_none() {
                            return;
                        }
                        let tick = async {
                            tokio::time::sleep(period).await;
                            let _ = fire_tx.send(()).await;
                        };
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tick => {}
                        }
                    }
                }
            }
        });

        Self {
            arm_tx,
            fire_rx,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Request the next fire. Returns `false` if an arm was already pending.
    pub fn arm(&self) -> bool {
        self.arm_tx.try_send(()).is_ok()
    }

    /// Wait for the next fire. `None` once the timer has been stopped.
    pub async fn fired(&mut self) -> Option<()> {
        self.fire_rx.recv().await
    }

    /// Stop the worker and wait for it to exit.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
