//! Broadcast hub
//!
//! Per-topic publish/subscribe registry behind every live-update channel.
//! Publishing never blocks: each subscriber owns a bounded queue that drops
//! its oldest message when full and counts what it dropped. Topics live in a
//! `DashMap`, so unrelated topics do not contend, and each topic has its own
//! lock.

pub mod queue;
pub mod topics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

pub use queue::Delivery;
use queue::SubscriberQueue;

/// Hub options
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Per-subscriber queue capacity
    pub queue_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

/// Counters for one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub name: String,
    pub subscribers: usize,
    pub publishers: usize,
    pub closed: bool,
}

struct TopicState<M> {
    subscribers: HashMap<u64, Arc<SubscriberQueue<M>>>,
    publishers: usize,
    closed: bool,
    retired: bool,
}

impl<M> TopicState<M> {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.publishers == 0
    }
}

struct TopicEntry<M> {
    name: String,
    state: Mutex<TopicState<M>>,
}

impl<M> TopicEntry<M> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState {
                subscribers: HashMap::new(),
                publishers: 0,
                closed: false,
                retired: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TopicState<M>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> TopicStats {
        let state = self.lock();
        TopicStats {
            name: self.name.clone(),
            subscribers: state.subscribers.len(),
            publishers: state.publishers,
            closed: state.closed,
        }
    }
}

struct HubInner<M> {
    topics: DashMap<String, Arc<TopicEntry<M>>>,
    next_subscriber_id: AtomicU64,
    options: HubOptions,
}

/// Shared publish/subscribe registry
pub struct Hub<M> {
    inner: Arc<HubInner<M>>,
}

impl<M> Clone for Hub<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + Sync + 'static> Hub<M> {
    pub fn new(options: HubOptions) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: DashMap::new(),
                next_subscriber_id: AtomicU64::new(1),
                options,
            }),
        }
    }

    fn lookup(&self, topic: &str) -> Option<Arc<TopicEntry<M>>> {
        self.inner.topics.get(topic).map(|entry| entry.value().clone())
    }

    fn get_or_create(&self, topic: &str) -> Arc<TopicEntry<M>> {
        if let Some(entry) = self.lookup(topic) {
            return entry;
        }
        self.inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!("Creating topic {}", topic);
                Arc::new(TopicEntry::new(topic))
            })
            .value()
            .clone()
    }

    /// Remove the topic if nobody publishes or listens anymore.
    /// Lock order is map entry, then topic state; never the reverse.
    fn try_retire(&self, topic: &str) {
        let removed = self.inner.topics.remove_if(topic, |_, entry| {
            let mut state = entry.lock();
            if state.is_idle() && !state.retired {
                state.retired = true;
                true
            } else {
                false
            }
        });
        if removed.is_some() {
            debug!("Retired topic {}", topic);
        }
    }

    /// Deliver to every current subscriber. Returns how many queues accepted it.
    pub fn publish(&self, topic: &str, message: M) -> usize {
        match self.lookup(topic) {
            Some(entry) => deliver(&entry, Arc::new(message)),
            None => 0,
        }
    }

    /// Register a publisher, creating the topic
    pub fn publisher(&self, topic: &str) -> Publisher<M> {
        loop {
            let entry = self.get_or_create(topic);
            let mut state = entry.lock();
            if state.retired {
                continue;
            }
            state.publishers += 1;
            drop(state);
            return Publisher {
                hub: self.clone(),
                entry,
            };
        }
    }

    /// Register a publisher only if the topic has none yet
    pub fn try_publisher(&self, topic: &str) -> Option<Publisher<M>> {
        loop {
            let entry = self.get_or_create(topic);
            let mut state = entry.lock();
            if state.retired {
                continue;
            }
            if state.publishers > 0 {
                return None;
            }
            state.publishers += 1;
            drop(state);
            return Some(Publisher {
                hub: self.clone(),
                entry,
            });
        }
    }

    /// Attach a new subscriber. Subscribing to a closed topic yields the sentinel.
    pub fn subscribe(&self, topic: &str) -> Subscription<M> {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.inner.options.queue_capacity));
        queue.touch();

        loop {
            let entry = self.get_or_create(topic);
            let mut state = entry.lock();
            if state.retired {
                continue;
            }
            if state.closed {
                queue.close();
            }
            state.subscribers.insert(id, queue.clone());
            drop(state);
            debug!("Subscriber {} attached to {}", id, topic);
            return Subscription {
                id,
                hub: self.clone(),
                entry,
                queue,
                detached: AtomicBool::new(false),
            };
        }
    }

    /// Detach a subscriber; safe to call more than once
    pub fn unsubscribe(&self, subscription: &Subscription<M>) {
        subscription.unsubscribe();
    }

    /// Send the terminal sentinel to current subscribers and reject later publishes
    pub fn close_topic(&self, topic: &str) -> usize {
        match self.lookup(topic) {
            Some(entry) => close(&entry),
            None => 0,
        }
    }

    /// Drop subscribers that have not drained or pinged within `idle_timeout`
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let mut reaped = 0;
        let mut emptied = Vec::new();

        for entry in self.entries() {
            let mut state = entry.lock();
            let stale: Vec<u64> = state
                .subscribers
                .iter()
                .filter(|(_, queue)| queue.idle_for() > idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(queue) = state.subscribers.remove(&id) {
                    queue.close();
                    reaped += 1;
                    debug!("Reaped idle subscriber {} on {}", id, entry.name);
                }
            }
            if state.is_idle() {
                emptied.push(entry.name.clone());
            }
        }

        for topic in emptied {
            self.try_retire(&topic);
        }
        reaped
    }

    pub fn stats(&self, topic: &str) -> Option<TopicStats> {
        self.lookup(topic).map(|entry| entry.stats())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.stats(topic).map(|s| s.subscribers).unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<TopicStats> {
        let mut stats: Vec<TopicStats> = self.entries().iter().map(|e| e.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn entries(&self) -> Vec<Arc<TopicEntry<M>>> {
        self.inner
            .topics
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

fn deliver<M>(entry: &TopicEntry<M>, message: Arc<M>) -> usize {
    let state = entry.lock();
    if state.closed {
        return 0;
    }
    state
        .subscribers
        .values()
        .filter(|queue| queue.push(message.clone()))
        .count()
}

fn close<M>(entry: &TopicEntry<M>) -> usize {
    let mut state = entry.lock();
    if state.closed {
        return 0;
    }
    state.closed = true;
    for queue in state.subscribers.values() {
        queue.close();
    }
    debug!("Closed topic {}", entry.name);
    state.subscribers.len()
}

/// Registered publisher; the topic lives at least as long as this handle
pub struct Publisher<M: Send + Sync + 'static> {
    hub: Hub<M>,
    entry: Arc<TopicEntry<M>>,
}

impl<M: Send + Sync + 'static> Publisher<M> {
    pub fn topic(&self) -> &str {
        &self.entry.name
    }

    pub fn publish(&self, message: M) -> usize {
        deliver(&self.entry, Arc::new(message))
    }

    pub fn close(&self) -> usize {
        close(&self.entry)
    }

    pub fn subscriber_count(&self) -> usize {
        self.entry.lock().subscribers.len()
    }
}

impl<M: Send + Sync + 'static> Drop for Publisher<M> {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.entry.lock();
            state.publishers = state.publishers.saturating_sub(1);
            state.is_idle()
        };
        if idle {
            self.hub.try_retire(&self.entry.name);
        }
    }
}

/// One observer's handle on a topic
pub struct Subscription<M: Send + Sync + 'static> {
    id: u64,
    hub: Hub<M>,
    entry: Arc<TopicEntry<M>>,
    queue: Arc<SubscriberQueue<M>>,
    detached: AtomicBool,
}

impl<M: Send + Sync + 'static> Subscription<M> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.entry.name
    }

    /// Wait for the next message or the terminal sentinel.
    /// Meant for a single consumer; dropping the future loses nothing.
    pub async fn recv(&self) -> Delivery<M> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Delivery<M>> {
        let delivery = self.queue.try_pop();
        if delivery.is_some() {
            self.queue.touch();
        }
        delivery
    }

    /// Messages evicted from this subscriber's queue so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Messages waiting to be drained
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Liveness ping
    pub fn touch(&self) {
        self.queue.touch();
    }

    pub fn unsubscribe(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = {
            let mut state = self.entry.lock();
            state.subscribers.remove(&self.id);
            state.is_idle()
        };
        self.queue.close();
        debug!("Subscriber {} detached from {}", self.id, self.entry.name);
        if idle {
            self.hub.try_retire(&self.entry.name);
        }
    }
}

impl<M: Send + Sync + 'static> Drop for Subscription<M> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
