// Eviction sweeper: drops subscribers that stopped polling.
use crate::chain::panic_message;
use crate::liveness::LivenessTable;
use crate::store::QueueStore;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    // Subscribers whose idle time exceeded the threshold.
    pub evicted: usize,
    // Queues left without a liveness entry.
    pub orphaned: usize,
}

#[derive(Debug)]
pub(crate) struct Sweeper {
    liveness: Arc<LivenessTable>,
    queues: Arc<QueueStore>,
    // Idle threshold in nanoseconds so it can change while a sweep task runs.
    idle_nanos: AtomicU64,
}

impl Sweeper {
    pub(crate) fn new(
        liveness: Arc<LivenessTable>,
        queues: Arc<QueueStore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            liveness,
            queues,
            idle_nanos: AtomicU64::new(duration_nanos(idle_timeout)),
        }
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.idle_nanos.load(Ordering::Relaxed))
    }

    pub(crate) fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.idle_nanos
            .store(duration_nanos(idle_timeout), Ordering::Relaxed);
    }

    pub(crate) fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let idle = self.idle_timeout();

        // Scan a snapshot, then remove key by key so no lock is held across the sweep.
        let mut evicted = 0;
        for subscriber in self.liveness.expired(now, idle) {
            if self.liveness.remove_if_expired(&subscriber, now, idle) {
                tracing::trace!(subscriber = %subscriber, "evicting idle subscriber");
                self.queues.remove(&subscriber);
                evicted += 1;
            }
        }

        // Queues created after the scan or left behind by explicit exclusion.
        let orphaned = self
            .queues
            .retain(|subscriber| self.liveness.contains(subscriber));

        metrics::counter!("backlog_cache_sweeps_total").increment(1);
        metrics::counter!("backlog_cache_evicted_total").increment(evicted as u64);
        metrics::gauge!("backlog_cache_subscribers").set(self.liveness.len() as f64);
        if evicted > 0 || orphaned > 0 {
            tracing::debug!(evicted, orphaned, "cache sweep finished");
        }
        SweepReport { evicted, orphaned }
    }

    /// Run one sweep; a panic is logged and reported as `None`.
    pub(crate) fn sweep_guarded(&self) -> Option<SweepReport> {
        match catch_unwind(AssertUnwindSafe(|| self.sweep())) {
            Ok(report) => Some(report),
            Err(panic) => {
                tracing::warn!(panic = panic_message(&panic), "cache sweep panicked");
                None
            }
        }
    }
}

/// Spawn the periodic sweep; the first run happens immediately.
pub(crate) fn spawn_sweeps(
    handle: &Handle,
    sweeper: Arc<Sweeper>,
    interval: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Fixed delay between runs rather than catching up missed ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let _ = sweeper.sweep_guarded();
        }
    })
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
