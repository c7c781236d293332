//! Bounded queues for messages that cannot be correlated yet.
//!
//! A [`Stash`] holds messages per correlation id, oldest first. Two limits
//! keep a permanently unresolvable correlation from growing without bound:
//!
//! - `max_per_key`: a full queue drops its oldest message
//! - `max_keys`: stashing under a new id when full drops the oldest id's
//!   whole queue
//!
//! Every drop is reported to the caller so it can be logged and counted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Limits applied to each of a cache's two stashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashConfig {
    /// Messages kept per correlation id
    pub max_per_key: usize,
    /// Correlation ids kept at once
    pub max_keys: usize,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StashConfig {
    /// 256 messages per id, 4096 ids.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_per_key: 256,
            max_keys: 4096,
        }
    }

    /// Set the per-id limit.
    #[must_use]
    pub const fn with_max_per_key(mut self, max_per_key: usize) -> Self {
        self.max_per_key = max_per_key;
        self
    }

    /// Set the id limit.
    #[must_use]
    pub const fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }
}

/// Messages dropped by one [`Stash::push`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evicted {
    /// Messages dropped from the pushed id's own queue
    pub oldest_messages: usize,
    /// Messages dropped with the oldest id's queue
    pub oldest_key: Option<(Uuid, usize)>,
}

impl Evicted {
    /// Total number of dropped messages.
    #[must_use]
    pub fn total(&self) -> usize {
        self.oldest_messages + self.oldest_key.map_or(0, |(_, count)| count)
    }
}

/// Per-id FIFO queues with eviction.
#[derive(Debug)]
pub struct Stash<M> {
    config: StashConfig,
    queues: HashMap<Uuid, VecDeque<M>>,
    order: VecDeque<Uuid>,
}

impl<M> Stash<M> {
    /// An empty stash.
    #[must_use]
    pub fn new(config: StashConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Queue `message` under `key`.
    pub fn push(&mut self, key: Uuid, message: M) -> Evicted {
        let mut evicted = Evicted::default();

        if !self.queues.contains_key(&key) {
            if self.queues.len() >= self.config.max_keys.max(1) {
                if let Some(oldest) = self.order.pop_front() {
                    let dropped = self.queues.remove(&oldest).map_or(0, |queue| queue.len());
                    evicted.oldest_key = Some((oldest, dropped));
                }
            }
            self.order.push_back(key);
        }

        let queue = self.queues.entry(key).or_default();
        queue.push_back(message);
        while queue.len() > self.config.max_per_key.max(1) {
            queue.pop_front();
            evicted.oldest_messages += 1;
        }
        evicted
    }

    /// Remove and return every message queued under `key`, oldest first.
    pub fn take(&mut self, key: Uuid) -> Vec<M> {
        match self.queues.remove(&key) {
            Some(queue) => {
                self.order.retain(|queued| *queued != key);
                queue.into()
            }
            None => Vec::new(),
        }
    }

    /// Number of ids with queued messages.
    #[must_use]
    pub fn keys(&self) -> usize {
        self.queues.len()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn messages(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Number of messages queued under `key`.
    #[must_use]
    pub fn queued(&self, key: Uuid) -> usize {
        self.queues.get(&key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u128) -> Vec<Uuid> {
        (1..=n).map(Uuid::from_u128).collect()
    }

    #[test]
    fn take_returns_messages_in_arrival_order() {
        let mut stash = Stash::new(StashConfig::new());
        let key = Uuid::from_u128(1);
        stash.push(key, "a");
        stash.push(key, "b");
        stash.push(Uuid::from_u128(2), "c");

        assert_eq!(stash.take(key), vec!["a", "b"]);
        assert!(stash.take(key).is_empty());
        assert_eq!(stash.keys(), 1);
        assert_eq!(stash.messages(), 1);
    }

    #[test]
    fn full_queue_drops_its_oldest_message() {
        let mut stash = Stash::new(StashConfig::new().with_max_per_key(2));
        let key = Uuid::from_u128(1);

        assert_eq!(stash.push(key, 1).total(), 0);
        assert_eq!(stash.push(key, 2).total(), 0);
        let evicted = stash.push(key, 3);

        assert_eq!(evicted.oldest_messages, 1);
        assert_eq!(stash.take(key), vec![2, 3]);
    }

    #[test]
    fn new_key_beyond_the_limit_drops_the_oldest_key() {
        let mut stash = Stash::new(StashConfig::new().with_max_keys(2));
        let keys = ids(3);
        stash.push(keys[0], 1);
        stash.push(keys[0], 2);
        stash.push(keys[1], 3);

        let evicted = stash.push(keys[2], 4);

        assert_eq!(evicted.oldest_key, Some((keys[0], 2)));
        assert_eq!(evicted.total(), 2);
        assert_eq!(stash.queued(keys[0]), 0);
        assert_eq!(stash.keys(), 2);
    }

    #[test]
    fn taken_keys_leave_the_eviction_order() {
        let mut stash = Stash::new(StashConfig::new().with_max_keys(2));
        let keys = ids(3);
        stash.push(keys[0], 1);
        stash.push(keys[1], 2);
        stash.take(keys[0]);

        let evicted = stash.push(keys[2], 3);

        assert_eq!(evicted.total(), 0);
        assert_eq!(stash.queued(keys[1]), 1);
        assert_eq!(stash.queued(keys[2]), 1);
    }
}
