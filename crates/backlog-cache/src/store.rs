// Per-subscriber queue store.
use crate::envelope::CachedMessage;
use ahash::RandomState;
use backlog_common::ids::MessageId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// FIFO of envelopes waiting for one subscriber.
#[derive(Debug, Default)]
pub struct ClientQueue {
    // Short critical sections only: append, scan, drain.
    messages: Mutex<VecDeque<CachedMessage>>,
}

impl ClientQueue {
    /// Append unless an envelope with the same id is already queued.
    pub fn push_unique(&self, message: CachedMessage) -> bool {
        let mut messages = self.messages.lock();
        // Depth is bounded by delivery cadence, so a linear scan is fine.
        if messages.iter().any(|queued| queued.id() == message.id()) {
            return false;
        }
        messages.push_back(message);
        true
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.lock().iter().any(|queued| queued.id() == id)
    }

    pub fn remove(&self, id: MessageId) -> Option<CachedMessage> {
        let mut messages = self.messages.lock();
        let index = messages.iter().position(|queued| queued.id() == id)?;
        messages.remove(index)
    }

    /// Take every queued envelope, oldest first.
    pub fn drain(&self) -> Vec<CachedMessage> {
        self.messages.lock().drain(..).collect()
    }

    pub fn snapshot(&self) -> Vec<CachedMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

/// Subscriber identity -> queue.
#[derive(Debug)]
pub struct QueueStore {
    queues: DashMap<String, Arc<ClientQueue>, RandomState>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subscriber: &str) -> Option<Arc<ClientQueue>> {
        self.queues.get(subscriber).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the queue for `subscriber` and whether this call created it.
    pub fn get_or_create(&self, subscriber: &str) -> (Arc<ClientQueue>, bool) {
        if let Some(queue) = self.get(subscriber) {
            return (queue, false);
        }
        let mut created = false;
        let queue = self
            .queues
            .entry(subscriber.to_owned())
            .or_insert_with(|| {
                created = true;
                Arc::new(ClientQueue::default())
            })
            .value()
            .clone();
        (queue, created)
    }

    /// Remove the mapping only if it still points at `queue`.
    pub fn discard(&self, subscriber: &str, queue: &Arc<ClientQueue>) -> bool {
        self.queues
            .remove_if(subscriber, |_, current| Arc::ptr_eq(current, queue))
            .is_some()
    }

    pub fn remove(&self, subscriber: &str) -> Option<Arc<ClientQueue>> {
        self.queues.remove(subscriber).map(|(_, queue)| queue)
    }

    /// Drop every queue whose subscriber fails `keep`; returns how many went.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.queues.len();
        self.queues.retain(|subscriber, _| keep(subscriber));
        before.saturating_sub(self.queues.len())
    }

    pub fn subscribers(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Total envelopes across all queues.
    pub fn queued_messages(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn clear(&self) {
        self.queues.clear();
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self {
            queues: DashMap::with_hasher(RandomState::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Recipient;
    use bytes::Bytes;

    fn envelope(payload: &'static [u8]) -> CachedMessage {
        CachedMessage::new(
            MessageId::new(),
            Bytes::from_static(payload),
            Recipient::subscriber("s"),
        )
    }

    #[test]
    fn queue_is_fifo_and_rejects_duplicate_ids() {
        let queue = ClientQueue::default();
        let first = envelope(b"1");
        assert!(queue.push_unique(first.clone()));
        assert!(queue.push_unique(envelope(b"2")));
        assert!(!queue.push_unique(first.clone()));
        let drained: Vec<_> = queue.drain().into_iter().map(CachedMessage::into_payload).collect();
        assert_eq!(drained, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_by_id_keeps_order_of_the_rest() {
        let queue = ClientQueue::default();
        let a = envelope(b"a");
        let b = envelope(b"b");
        let c = envelope(b"c");
        queue.push_unique(a.clone());
        queue.push_unique(b.clone());
        queue.push_unique(c.clone());
        assert_eq!(queue.remove(b.id()), Some(b.clone()));
        assert!(queue.remove(b.id()).is_none());
        assert!(!queue.contains(b.id()));
        assert_eq!(queue.snapshot(), vec![a, c]);
    }

    #[test]
    fn get_or_create_reports_creation_once() {
        let store = QueueStore::new();
        let (first, created) = store.get_or_create("s");
        assert!(created);
        let (second, created) = store.get_or_create("s");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn discard_only_removes_the_same_queue() {
        let store = QueueStore::new();
        let (stale, _) = store.get_or_create("s");
        store.remove("s");
        let (fresh, _) = store.get_or_create("s");
        assert!(!store.discard("s", &stale));
        assert!(store.discard("s", &fresh));
        assert!(store.is_empty());
    }

    #[test]
    fn retain_counts_removed_queues() {
        let store = QueueStore::new();
        store.get_or_create("a");
        store.get_or_create("b");
        store.get_or_create("c");
        let removed = store.retain(|subscriber| subscriber == "b");
        assert_eq!(removed, 2);
        assert_eq!(store.subscribers(), vec!["b".to_string()]);
    }
}
