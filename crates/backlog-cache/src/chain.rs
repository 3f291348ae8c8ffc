// Inspection and notification chains.
//
// Both chains keep a registry behind a mutex for the (rare) mutation path and
// publish an immutable snapshot the admission path reads without locking.
use crate::envelope::{BroadcastMessage, CachedMessage};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Error type observers may return.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Decides whether a message may be cached at all.
///
/// ```
/// use backlog_cache::{BroadcastMessage, CacheInspector};
///
/// let skip_empty = |message: &BroadcastMessage| !message.message().is_empty();
/// assert!(skip_empty.inspect(&BroadcastMessage::new("hi")).expect("inspect"));
/// assert!(!skip_empty.inspect(&BroadcastMessage::new("")).expect("inspect"));
/// ```
pub trait CacheInspector: Send + Sync {
    fn inspect(&self, message: &BroadcastMessage) -> Result<bool, ObserverError>;
}

impl<F> CacheInspector for F
where
    F: Fn(&BroadcastMessage) -> bool + Send + Sync,
{
    fn inspect(&self, message: &BroadcastMessage) -> Result<bool, ObserverError> {
        Ok(self(message))
    }
}

/// Observes envelopes entering and leaving subscriber queues.
pub trait CacheListener: Send + Sync {
    fn on_add(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_remove(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Add,
    Remove,
}

impl Hook {
    fn as_str(self) -> &'static str {
        match self {
            Hook::Add => "on_add",
            Hook::Remove => "on_remove",
        }
    }
}

pub(crate) struct InspectorChain {
    snapshot: ArcSwap<Vec<Arc<dyn CacheInspector>>>,
    registry: Mutex<Vec<Arc<dyn CacheInspector>>>,
}

impl InspectorChain {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, inspector: Arc<dyn CacheInspector>) {
        let mut registry = self.registry.lock();
        registry.push(inspector);
        self.snapshot.store(Arc::new(registry.clone()));
    }

    /// True when every inspector accepts. Errors and panics count as a veto.
    pub(crate) fn admits(&self, message: &BroadcastMessage) -> bool {
        let inspectors = self.snapshot.load();
        for inspector in inspectors.iter() {
            match catch_unwind(AssertUnwindSafe(|| inspector.inspect(message))) {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return false,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "cache inspector failed; not caching");
                    metrics::counter!("backlog_cache_inspector_errors_total").increment(1);
                    return false;
                }
                Err(panic) => {
                    tracing::warn!(
                        panic = panic_message(&panic),
                        "cache inspector panicked; not caching"
                    );
                    metrics::counter!("backlog_cache_inspector_errors_total").increment(1);
                    return false;
                }
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub(crate) fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.clear();
        self.snapshot.store(Arc::new(Vec::new()));
    }
}

pub(crate) struct ListenerChain {
    snapshot: ArcSwap<Vec<Arc<dyn CacheListener>>>,
    registry: Mutex<Vec<Arc<dyn CacheListener>>>,
}

impl ListenerChain {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, listener: Arc<dyn CacheListener>) {
        let mut registry = self.registry.lock();
        registry.push(listener);
        self.snapshot.store(Arc::new(registry.clone()));
    }

    /// Remove by identity; returns whether the listener was registered.
    pub(crate) fn remove(&self, listener: &Arc<dyn CacheListener>) -> bool {
        let mut registry = self.registry.lock();
        let Some(index) = registry
            .iter()
            .position(|registered| Arc::ptr_eq(registered, listener))
        else {
            return false;
        };
        registry.remove(index);
        self.snapshot.store(Arc::new(registry.clone()));
        true
    }

    pub(crate) fn notify_add(&self, channel: &str, message: &CachedMessage) {
        self.notify(Hook::Add, channel, message);
    }

    pub(crate) fn notify_remove(&self, channel: &str, message: &CachedMessage) {
        self.notify(Hook::Remove, channel, message);
    }

    // Every listener runs; failures are logged and never reach the caller.
    fn notify(&self, hook: Hook, channel: &str, message: &CachedMessage) {
        let listeners = self.snapshot.load();
        for listener in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match hook {
                Hook::Add => listener.on_add(channel, message),
                Hook::Remove => listener.on_remove(channel, message),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        hook = hook.as_str(),
                        channel,
                        message_id = %message.id(),
                        error = %err,
                        "cache listener failed"
                    );
                    metrics::counter!("backlog_cache_listener_errors_total").increment(1);
                }
                Err(panic) => {
                    tracing::warn!(
                        hook = hook.as_str(),
                        channel,
                        message_id = %message.id(),
                        panic = panic_message(&panic),
                        "cache listener panicked"
                    );
                    metrics::counter!("backlog_cache_listener_errors_total").increment(1);
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub(crate) fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.clear();
        self.snapshot.store(Arc::new(Vec::new()));
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Recipient;
    use backlog_common::ids::MessageId;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl CacheListener for Counting {
        fn on_add(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_remove(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl CacheListener for Failing {
        fn on_add(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
            Err("boom".into())
        }

        fn on_remove(&self, _channel: &str, _message: &CachedMessage) -> Result<(), ObserverError> {
            panic!("listener panic");
        }
    }

    struct Erroring;

    impl CacheInspector for Erroring {
        fn inspect(&self, _message: &BroadcastMessage) -> Result<bool, ObserverError> {
            Err("cannot inspect".into())
        }
    }

    fn envelope() -> CachedMessage {
        CachedMessage::new(MessageId::new(), Bytes::from_static(b"m"), Recipient::All)
    }

    #[test]
    fn empty_inspector_chain_admits() {
        let chain = InspectorChain::new();
        assert!(chain.admits(&BroadcastMessage::new("m")));
    }

    #[test]
    fn inspector_chain_short_circuits_on_veto() {
        let chain = InspectorChain::new();
        let later = Arc::new(AtomicUsize::new(0));
        chain.push(Arc::new(|_: &BroadcastMessage| false));
        let seen = Arc::clone(&later);
        chain.push(Arc::new(move |_: &BroadcastMessage| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert!(!chain.admits(&BroadcastMessage::new("m")));
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inspector_error_fails_closed() {
        let chain = InspectorChain::new();
        chain.push(Arc::new(Erroring));
        assert!(!chain.admits(&BroadcastMessage::new("m")));
    }

    #[test]
    fn inspector_panic_fails_closed() {
        let chain = InspectorChain::new();
        chain.push(Arc::new(|_: &BroadcastMessage| -> bool { panic!("inspector panic") }));
        assert!(!chain.admits(&BroadcastMessage::new("m")));
    }

    #[test]
    fn failing_listener_does_not_stop_the_next_one() {
        let chain = ListenerChain::new();
        let counting = Arc::new(Counting::default());
        chain.push(Arc::new(Failing));
        chain.push(counting.clone());
        let message = envelope();
        chain.notify_add("c", &message);
        chain.notify_remove("c", &message);
        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_listener_by_identity() {
        let chain = ListenerChain::new();
        let first: Arc<dyn CacheListener> = Arc::new(Counting::default());
        let second: Arc<dyn CacheListener> = Arc::new(Counting::default());
        chain.push(Arc::clone(&first));
        chain.push(Arc::clone(&second));
        assert!(chain.remove(&first));
        assert!(!chain.remove(&first));
        assert_eq!(chain.len(), 1);
        chain.clear();
        assert_eq!(chain.len(), 0);
    }
}
