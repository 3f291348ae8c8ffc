// Subscriber liveness table: identity -> last time it was seen.
use ahash::RandomState;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks which subscribers are caching candidates.
///
/// Backed by a sharded map so refreshes for different subscribers do not
/// contend on one lock.
#[derive(Debug)]
pub struct LivenessTable {
    entries: DashMap<String, Instant, RandomState>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh the entry for `subscriber`.
    pub fn touch(&self, subscriber: &str) -> Instant {
        let now = Instant::now();
        // Refresh in place to avoid allocating the key on the hot path.
        if let Some(mut last_seen) = self.entries.get_mut(subscriber) {
            *last_seen = now;
            return now;
        }
        self.entries.insert(subscriber.to_owned(), now);
        now
    }

    /// Refresh only if the subscriber is already tracked.
    pub fn refresh(&self, subscriber: &str) -> bool {
        match self.entries.get_mut(subscriber) {
            Some(mut last_seen) => {
                *last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, subscriber: &str) -> bool {
        self.entries.contains_key(subscriber)
    }

    pub fn last_seen(&self, subscriber: &str) -> Option<Instant> {
        self.entries.get(subscriber).map(|entry| *entry)
    }

    pub fn remove(&self, subscriber: &str) -> bool {
        self.entries.remove(subscriber).is_some()
    }

    /// Point-in-time copy of the tracked identities.
    pub fn subscribers(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Identities whose last refresh is older than `idle` at `now`.
    pub fn expired(&self, now: Instant, idle: Duration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| is_expired(*entry.value(), now, idle))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove `subscriber` only if it is still expired; a refresh that raced
    /// the scan keeps the entry.
    pub fn remove_if_expired(&self, subscriber: &str, now: Instant, idle: Duration) -> bool {
        self.entries
            .remove_if(subscriber, |_, last_seen| is_expired(*last_seen, now, idle))
            .is_some()
    }

    /// Identity and time since last refresh for every tracked subscriber.
    pub fn idle_times(&self, now: Instant) -> Vec<(String, Duration)> {
        self.entries
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    now.saturating_duration_since(*entry.value()),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for LivenessTable {
    fn default() -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }
}

#[inline]
fn is_expired(last_seen: Instant, now: Instant, idle: Duration) -> bool {
    now.saturating_duration_since(last_seen) > idle
}
