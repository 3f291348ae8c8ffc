// Cache facade: coordinates liveness, queues, chains and the sweep lifecycle.
use crate::chain::{CacheInspector, CacheListener, InspectorChain, ListenerChain};
use crate::envelope::{BroadcastMessage, CachedMessage, Recipient};
use crate::liveness::LivenessTable;
use crate::scheduler::SweepScheduler;
use crate::store::QueueStore;
use crate::sweeper::{SweepReport, Sweeper, spawn_sweeps};
use crate::{CacheError, Result};
use backlog_common::CacheOptions;
use backlog_common::ids::MessageId;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle phase of a [`BroadcasterCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

impl Phase {
    fn as_u8(self) -> u8 {
        match self {
            Phase::Unconfigured => 0,
            Phase::Configured => 1,
            Phase::Running => 2,
            Phase::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Configured,
            2 => Phase::Running,
            3 => Phase::Stopped,
            _ => Phase::Unconfigured,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unconfigured => "unconfigured",
            Phase::Configured => "configured",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time counters for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub phase: Phase,
    pub subscribers: usize,
    pub queues: usize,
    pub queued_messages: usize,
    pub inspectors: usize,
    pub listeners: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admitted,
    Duplicate,
    Stale,
}

// Mutable lifecycle state; only touched by configure/start/stop and reconfiguration.
struct Lifecycle {
    options: CacheOptions,
    scheduler: Option<SweepScheduler>,
    task: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Per-subscriber message cache for one broadcasting domain.
///
/// Messages published while a subscriber is detached are buffered under the
/// subscriber's stable identity and handed over, exactly once, the next time
/// it attaches or polls.
///
/// ```
/// use backlog_cache::{BroadcastMessage, BroadcasterCache, Recipient};
/// use backlog_common::CacheOptions;
/// use bytes::Bytes;
///
/// let cache = BroadcasterCache::new();
/// cache.configure(CacheOptions::default().with_shared_scheduler(false)).expect("configure");
/// cache.cache_candidate("news", "client-1");
/// cache.add_to_cache("news", Recipient::subscriber("client-1"), BroadcastMessage::new("hello"));
/// assert_eq!(
///     cache.retrieve_from_cache("news", "client-1"),
///     vec![Bytes::from_static(b"hello")]
/// );
/// assert!(cache.retrieve_from_cache("news", "client-1").is_empty());
/// cache.stop().expect("stop");
/// ```
pub struct BroadcasterCache {
    liveness: Arc<LivenessTable>,
    queues: Arc<QueueStore>,
    // Admission holds this shared across "lookup, create, recheck, append";
    // retrieval holds it exclusively across "remove queue, drain".
    swap_lock: RwLock<()>,
    inspectors: InspectorChain,
    listeners: ListenerChain,
    sweeper: Arc<Sweeper>,
    // Mirrors the lifecycle phase for lock-free checks on the hot path.
    phase: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
    // Runtime to use when a shared scheduler is requested.
    shared_runtime: Option<Handle>,
}

impl BroadcasterCache {
    pub fn new() -> Self {
        let options = CacheOptions::default();
        let liveness = Arc::new(LivenessTable::new());
        let queues = Arc::new(QueueStore::new());
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&liveness),
            Arc::clone(&queues),
            options.client_idle_timeout,
        ));
        Self {
            liveness,
            queues,
            swap_lock: RwLock::new(()),
            inspectors: InspectorChain::new(),
            listeners: ListenerChain::new(),
            sweeper,
            phase: AtomicU8::new(Phase::Unconfigured.as_u8()),
            lifecycle: Mutex::new(Lifecycle {
                options,
                scheduler: None,
                task: None,
            }),
            shared_runtime: None,
        }
    }

    /// Use `handle` whenever the options ask for a shared scheduler.
    pub fn with_shared_runtime(mut self, handle: Handle) -> Self {
        self.shared_runtime = Some(handle);
        self
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    // Operations only persist state once configured and until stopped.
    #[inline]
    fn accepting(&self) -> bool {
        matches!(self.phase(), Phase::Configured | Phase::Running)
    }

    pub fn options(&self) -> CacheOptions {
        self.lifecycle.lock().options.clone()
    }

    /// Apply options and select the sweep scheduler.
    pub fn configure(&self, options: CacheOptions) -> Result<()> {
        options.validate()?;
        let mut lifecycle = self.lifecycle.lock();
        let from = self.phase();
        if from == Phase::Running {
            return Err(CacheError::InvalidTransition {
                from,
                to: Phase::Configured,
            });
        }
        let scheduler =
            SweepScheduler::select(options.shared_scheduler, self.shared_runtime.as_ref())?;
        if let Some(previous) = lifecycle.scheduler.replace(scheduler) {
            previous.release();
        }
        self.sweeper.set_idle_timeout(options.client_idle_timeout);
        tracing::info!(
            shared_scheduler = options.shared_scheduler,
            idle_timeout_ms = options.client_idle_timeout.as_millis() as u64,
            sweep_interval_ms = options.sweep_interval.as_millis() as u64,
            "broadcaster cache configured"
        );
        lifecycle.options = options;
        self.set_phase(Phase::Configured);
        Ok(())
    }

    /// Parse string properties and configure; malformed values are rejected here.
    pub fn configure_from_properties(&self, props: &HashMap<String, String>) -> Result<()> {
        let options = CacheOptions::from_properties(props)?;
        self.configure(options)
    }

    /// Schedule the first sweep immediately and then on the configured interval.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let from = self.phase();
        if from != Phase::Configured {
            return Err(CacheError::InvalidTransition {
                from,
                to: Phase::Running,
            });
        }
        let Some(scheduler) = lifecycle.scheduler.as_ref() else {
            return Err(CacheError::Scheduler("no scheduler configured".into()));
        };
        let task = spawn_sweeps(
            &scheduler.handle(),
            Arc::clone(&self.sweeper),
            lifecycle.options.sweep_interval,
        );
        lifecycle.task = Some(task);
        self.set_phase(Phase::Running);
        tracing::info!("broadcaster cache started");
        Ok(())
    }

    /// Cancel sweeps, drop all state and release a dedicated scheduler.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let from = self.phase();
        if !matches!(from, Phase::Configured | Phase::Running) {
            return Err(CacheError::InvalidTransition {
                from,
                to: Phase::Stopped,
            });
        }
        self.set_phase(Phase::Stopped);
        lifecycle.cancel_task();
        self.clear_state();
        if let Some(scheduler) = lifecycle.scheduler.take() {
            scheduler.release();
        }
        tracing::info!("broadcaster cache stopped");
        Ok(())
    }

    /// Clear liveness, queues and both chains and cancel the pending sweep,
    /// keeping the scheduler.
    pub fn cleanup(&self) {
        self.lifecycle.lock().cancel_task();
        if self.phase() == Phase::Running {
            self.set_phase(Phase::Configured);
        }
        self.clear_state();
    }

    fn clear_state(&self) {
        let _guard = self.swap_lock.write();
        self.queues.clear();
        self.liveness.clear();
        self.inspectors.clear();
        self.listeners.clear();
    }

    /// Change the sweep period; a running schedule is cancelled and restarted.
    pub fn set_sweep_interval(&self, interval: Duration) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let options = lifecycle.options.clone().with_sweep_interval(interval);
        options.validate()?;
        lifecycle.options = options;
        if self.phase() == Phase::Running {
            lifecycle.cancel_task();
            if let Some(scheduler) = lifecycle.scheduler.as_ref() {
                lifecycle.task = Some(spawn_sweeps(
                    &scheduler.handle(),
                    Arc::clone(&self.sweeper),
                    interval,
                ));
            }
        }
        Ok(())
    }

    /// Change the idle threshold; applies from the next sweep.
    pub fn set_client_idle_timeout(&self, idle_timeout: Duration) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.options.client_idle_timeout = idle_timeout;
        self.sweeper.set_idle_timeout(idle_timeout);
    }

    /// Buffer `message` for `recipient` and return its envelope.
    ///
    /// The envelope is returned whether or not anything was cached: a veto,
    /// a stale subscriber or an inactive cache all leave the store untouched.
    pub fn add_to_cache(
        &self,
        channel: &str,
        recipient: Recipient,
        message: BroadcastMessage,
    ) -> CachedMessage {
        let id = message.id().unwrap_or_default();
        let envelope = CachedMessage::new(id, message.message().clone(), recipient);
        if !self.accepting() {
            return envelope;
        }
        if !self.inspectors.admits(&message) {
            tracing::trace!(channel, message_id = %id, "message vetoed by inspector");
            metrics::counter!("backlog_cache_vetoed_total").increment(1);
            return envelope;
        }

        match envelope.recipient() {
            Recipient::All => {
                // Best effort: subscribers appearing during the fan-out may miss it.
                for subscriber in self.liveness.subscribers() {
                    self.admit_and_notify(channel, &subscriber, &envelope);
                }
            }
            Recipient::Subscriber(subscriber) => {
                // Refresh, never resurrect: an evicted subscriber must attach again.
                self.liveness.refresh(subscriber);
                self.admit_and_notify(channel, subscriber, &envelope);
            }
        }
        envelope
    }

    fn admit_and_notify(&self, channel: &str, subscriber: &str, envelope: &CachedMessage) {
        match self.admit(subscriber, envelope) {
            Admission::Admitted => {
                tracing::trace!(channel, subscriber, message_id = %envelope.id(), "message cached");
                metrics::counter!("backlog_cache_admitted_total").increment(1);
                // Outside the swap lock so listeners may call back into the cache.
                self.listeners.notify_add(channel, envelope);
            }
            Admission::Duplicate => {
                tracing::debug!(channel, subscriber, message_id = %envelope.id(), "duplicate message not cached");
                metrics::counter!("backlog_cache_duplicate_total").increment(1);
            }
            Admission::Stale => {
                tracing::debug!(channel, subscriber, message_id = %envelope.id(), "subscriber no longer active; message dropped");
                metrics::counter!("backlog_cache_dropped_stale_total").increment(1);
            }
        }
    }

    fn admit(&self, subscriber: &str, envelope: &CachedMessage) -> Admission {
        let _guard = self.swap_lock.read();
        let queue = match self.queues.get(subscriber) {
            Some(queue) => queue,
            None => {
                if !self.liveness.contains(subscriber) {
                    return Admission::Stale;
                }
                let (queue, created) = self.queues.get_or_create(subscriber);
                // The sweeper may have evicted the subscriber since the check above.
                if created && !self.liveness.contains(subscriber) {
                    self.queues.discard(subscriber, &queue);
                    return Admission::Stale;
                }
                queue
            }
        };
        if queue.push_unique(envelope.clone()) {
            Admission::Admitted
        } else {
            Admission::Duplicate
        }
    }

    /// Mark `subscriber` active and hand over everything queued for it.
    pub fn retrieve_from_cache(&self, channel: &str, subscriber: &str) -> Vec<Bytes> {
        if !self.accepting() {
            return Vec::new();
        }
        let messages = {
            let _guard = self.swap_lock.write();
            self.liveness.touch(subscriber);
            match self.queues.remove(subscriber) {
                Some(queue) => queue.drain(),
                None => return Vec::new(),
            }
        };
        tracing::trace!(channel, subscriber, count = messages.len(), "retrieved cached messages");
        metrics::counter!("backlog_cache_retrieved_total").increment(messages.len() as u64);
        messages.into_iter().map(CachedMessage::into_payload).collect()
    }

    /// Remove one envelope from a subscriber queue, notifying listeners first.
    pub fn clear_cache(&self, channel: &str, subscriber: &str, message: &CachedMessage) -> &Self {
        if let Some(queue) = self.queues.get(subscriber)
            && !queue.is_empty()
        {
            tracing::trace!(channel, subscriber, message_id = %message.id(), "removing cached message");
            self.listeners
                .notify_remove(channel, &message.addressed_to(subscriber));
            queue.remove(message.id());
        }
        self
    }

    /// Mark `subscriber` as a caching candidate without caching anything.
    pub fn cache_candidate(&self, _channel: &str, subscriber: &str) -> &Self {
        if self.accepting() {
            self.liveness.touch(subscriber);
        }
        self
    }

    /// Stop caching for `subscriber` now; its queue goes on the next sweep.
    pub fn exclude_from_cache(&self, channel: &str, subscriber: &str) -> &Self {
        if self.liveness.remove(subscriber) {
            tracing::trace!(channel, subscriber, "subscriber excluded from cache");
        }
        self
    }

    pub fn add_inspector(&self, inspector: impl CacheInspector + 'static) -> &Self {
        self.inspectors.push(Arc::new(inspector));
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) -> &Self {
        self.listeners.push(listener);
        self
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) -> &Self {
        self.listeners.remove(listener);
        self
    }

    /// Run one eviction sweep now, independent of the schedule.
    pub fn invalidate_expired_entries(&self) -> SweepReport {
        self.sweeper.sweep_guarded().unwrap_or_default()
    }

    /// Subscriber identities with their time since last activity.
    pub fn subscribers(&self) -> Vec<(String, Duration)> {
        self.liveness.idle_times(Instant::now())
    }

    pub fn is_candidate(&self, subscriber: &str) -> bool {
        self.liveness.contains(subscriber)
    }

    /// Copy of the envelopes queued for `subscriber`.
    pub fn queued(&self, subscriber: &str) -> Vec<CachedMessage> {
        self.queues
            .get(subscriber)
            .map(|queue| queue.snapshot())
            .unwrap_or_default()
    }

    pub fn has_message(&self, subscriber: &str, id: MessageId) -> bool {
        self.queues
            .get(subscriber)
            .is_some_and(|queue| queue.contains(id))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            phase: self.phase(),
            subscribers: self.liveness.len(),
            queues: self.queues.len(),
            queued_messages: self.queues.queued_messages(),
            inspectors: self.inspectors.len(),
            listeners: self.listeners.len(),
        }
    }
}

impl Default for BroadcasterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BroadcasterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcasterCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for BroadcasterCache {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        lifecycle.cancel_task();
        if let Some(scheduler) = lifecycle.scheduler.take() {
            scheduler.release();
        }
    }
}
