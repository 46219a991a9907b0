//! Bounded per-subscriber queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// What a subscriber gets out of its queue
#[derive(Debug)]
pub enum Delivery<M> {
    Message(Arc<M>),

    /// Terminal sentinel: the topic was closed or the subscription reaped
    Closed,
}

impl<M> Delivery<M> {
    pub fn is_closed(&self) -> bool {
        matches!(self, Delivery::Closed)
    }

    pub fn into_message(self) -> Option<Arc<M>> {
        match self {
            Delivery::Message(msg) => Some(msg),
            Delivery::Closed => None,
        }
    }
}

struct QueueState<M> {
    items: VecDeque<Arc<M>>,
    closed: bool,
}

pub(crate) struct SubscriberQueue<M> {
    state: Mutex<QueueState<M>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl<M> SubscriberQueue<M> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; evicts the oldest message when full.
    /// Returns false once the queue is closed.
    pub(crate) fn push(&self, msg: Arc<M>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    /// Mark closed; queued messages are still delivered before the sentinel
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<Delivery<M>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.items.pop_front() {
            Some(msg) => Some(Delivery::Message(msg)),
            None if state.closed => Some(Delivery::Closed),
            None => None,
        }
    }

    /// Single consumer. Cancel-safe: nothing is removed until a value is returned.
    pub(crate) async fn pop(&self) -> Delivery<M> {
        loop {
            if let Some(delivery) = self.try_pop() {
                self.touch();
                return delivery;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.items.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last_seen)
    }
}
