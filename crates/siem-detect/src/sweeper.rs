//! Maintenance Sweeper
//!
//! Windowed state (threshold counters, partial sequences, dedup
//! fingerprints) needs periodic eviction. Instead of one ad-hoc polling
//! loop per component, a single ticking source feeds a bounded work
//! queue consumed by a fixed-size worker pool; a slow sweep can delay
//! other sweeps but can never fan out unbounded work.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A component holding expirable state.
pub trait Sweepable: Send + Sync {
    /// Component name, for logs.
    fn name(&self) -> &'static str;
    /// Evict state that is stale as of `now`.
    fn sweep(&self, now: DateTime<Utc>);
}

/// Sweeper configuration.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Bounded queue depth; jobs beyond it are dropped until the next tick
    pub queue_depth: usize,
    /// Worker pool size
    pub workers: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            queue_depth: 16,
            workers: 2,
        }
    }
}

/// Handle over the running sweeper tasks.
pub struct SweeperHandle {
    ticker: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the ticker and workers.
    pub fn stop(self) {
        self.ticker.abort();
        for worker in self.workers {
            worker.abort();
        }
    }
}

/// Spawn the ticker and worker pool over the given targets.
pub fn spawn(config: SweeperConfig, targets: Vec<Arc<dyn Sweepable>>) -> SweeperHandle {
    let (tx, rx) = mpsc::channel::<Arc<dyn Sweepable>>(config.queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let workers = (0..config.workers.max(1))
        .map(|worker_id| {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let target = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match target {
                        Some(target) => {
                            let now = Utc::now();
                            target.sweep(now);
                            tracing::debug!(worker_id, target = target.name(), "sweep complete");
                        }
                        None => break,
                    }
                }
            })
        })
        .collect();

    let interval_secs = config.interval_secs.max(1);
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            for target in &targets {
                // Queue full means a sweep is already pending; skip.
                if tx.try_send(Arc::clone(target)).is_err() {
                    tracing::debug!(target = target.name(), "sweep queue full, skipping tick");
                }
            }
        }
    });

    SweeperHandle { ticker, workers }
}
