//! Log fan-out broadcaster.
//!
//! One ordered stream of console lines goes out to any number of
//! independent subscribers, each behind its own bounded queue. Publishing
//! never blocks on a slow consumer: a full queue sheds that subscriber's
//! oldest pending line. A bounded backlog of recent lines primes new
//! subscribers so a freshly opened console is not empty.

use gsc_core::{LogLine, LogSource};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info};

struct QueueInner {
    items: VecDeque<LogLine>,
    closed: bool,
    /// Lines shed because this consumer lagged.
    dropped: u64,
}

/// A single subscriber's bounded delivery queue.
struct SubscriberQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueue a line, shedding the oldest pending one if the queue is
    /// full. Returns true if a line was shed.
    fn push(&self, line: LogLine) -> bool {
        let shed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed {
                return false;
            }
            let shed = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                true
            } else {
                false
            };
            inner.items.push_back(line);
            shed
        };
        self.notify.notify_one();
        shed
    }

    fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    /// Dequeue the next line, waiting if the queue is empty.
    /// Returns None once the queue is closed and drained.
    async fn pop(&self) -> Option<LogLine> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(line) = inner.items.pop_front() {
                    return Some(line);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn dropped(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }
}

struct Registry {
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    backlog: VecDeque<LogLine>,
    next_id: u64,
    next_seq: u64,
}

/// Fans one ordered line stream out to all current subscribers.
///
/// The registry lock makes every publish a consistent snapshot of the
/// subscriber set: a concurrent unsubscribe sees either the whole line
/// delivered or not at all, never a torn delivery.
pub struct LogBroadcaster {
    backlog_capacity: usize,
    queue_capacity: usize,
    registry: Mutex<Registry>,
}

/// Handle to one subscriber's queue; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    broadcaster: Arc<LogBroadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next line in publish order. None once unsubscribed.
    pub async fn recv(&self) -> Option<LogLine> {
        self.queue.pop().await
    }

    /// Lines this subscriber has lost to backpressure shedding.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

impl LogBroadcaster {
    pub fn new(backlog_capacity: usize, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            backlog_capacity,
            queue_capacity,
            registry: Mutex::new(Registry {
                subscribers: HashMap::new(),
                backlog: VecDeque::new(),
                next_id: 1,
                next_seq: 1,
            }),
        })
    }

    /// Register a new subscriber, primed with the retained backlog
    /// (oldest-first) ahead of live delivery. Non-blocking.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;

        let queue = SubscriberQueue::new(self.queue_capacity);
        for line in &registry.backlog {
            queue.push(line.clone());
        }
        registry.subscribers.insert(id, queue.clone());
        info!(
            subscriber = id,
            total = registry.subscribers.len(),
            "console subscriber attached"
        );

        Subscription {
            id,
            queue,
            broadcaster: self.clone(),
        }
    }

    /// Remove a subscriber and close its queue. Safe to call concurrently
    /// with an in-flight publish, and again for an already-removed id.
    pub fn unsubscribe(&self, id: u64) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = registry.subscribers.remove(&id) {
            queue.close();
            info!(
                subscriber = id,
                total = registry.subscribers.len(),
                "console subscriber detached"
            );
        }
    }

    /// Publish one line: append it to the backlog and enqueue it to every
    /// current subscriber in the same relative order. Never blocks on a
    /// slow consumer. Returns the assigned sequence number.
    pub fn publish(&self, source: LogSource, text: impl Into<String>) -> u64 {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let seq = registry.next_seq;
        registry.next_seq += 1;
        let line = LogLine::new(seq, source, text);

        if registry.backlog.len() >= self.backlog_capacity {
            registry.backlog.pop_front();
        }
        registry.backlog.push_back(line.clone());

        for (id, queue) in &registry.subscribers {
            if queue.push(line.clone()) {
                debug!(subscriber = *id, seq, "slow consumer, shed oldest pending line");
            }
        }
        seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}
