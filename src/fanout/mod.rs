//! Real-time subscriber fan-out.
//!
//! A registry of subscribers, each with a bounded in-memory queue. Publishing
//! never blocks: when a subscriber's queue is full the oldest pending message
//! is dropped and the subscriber's drop counter incremented. FIFO order is
//! preserved per subscriber; nothing is guaranteed across topics or
//! subscribers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Closed set of publish/subscribe topics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Topic {
    #[serde(rename = "sensor.update")]
    SensorUpdate,
    #[serde(rename = "detection.result")]
    DetectionResult,
    #[serde(rename = "alert.new")]
    AlertNew,
    #[serde(rename = "alert.acknowledged")]
    AlertAcknowledged,
    #[serde(rename = "alert.resolved")]
    AlertResolved,
    #[serde(rename = "valve.changed")]
    ValveChanged,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::SensorUpdate,
        Topic::DetectionResult,
        Topic::AlertNew,
        Topic::AlertAcknowledged,
        Topic::AlertResolved,
        Topic::ValveChanged,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::SensorUpdate => "sensor.update",
            Topic::DetectionResult => "detection.result",
            Topic::AlertNew => "alert.new",
            Topic::AlertAcknowledged => "alert.acknowledged",
            Topic::AlertResolved => "alert.resolved",
            Topic::ValveChanged => "valve.changed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown topic: {s}"))
    }
}

/// One published message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

/// Per-subscriber bounded queue with drop-oldest overflow.
#[derive(Debug)]
struct SubscriberQueue {
    messages: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    closed: Mutex<bool>,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            closed: Mutex::new(false),
        }
    }

    fn push(&self, envelope: Envelope) {
        {
            let mut queue = lock_unpoisoned(&self.messages);
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        *lock_unpoisoned(&self.closed) = true;
        self.notify.notify_waiters();
        // Stored permit for a receiver not yet parked on the Notify.
        self.notify.notify_one();
    }
}

/// Subscriber handle. Dropping the handle does not unsubscribe; call
/// `FanoutHub::unsubscribe` (idempotent) to release the registration.
pub struct Subscription {
    id: u64,
    topics: HashSet<Topic>,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topics(&self) -> impl Iterator<Item = Topic> + '_ {
        self.topics.iter().copied()
    }

    /// Await the next message. Returns None once the hub unsubscribed this
    /// handle and the queue drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if *lock_unpoisoned(&self.queue.closed) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Pop the next pending message without waiting.
    pub fn try_recv(&self) -> Option<Envelope> {
        lock_unpoisoned(&self.queue.messages).pop_front()
    }

    /// Messages discarded because this subscriber fell behind.
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.queue.messages).len()
    }
}

/// Subscriber registry keyed by id.
pub struct FanoutHub {
    subscribers: Mutex<HashMap<u64, (HashSet<Topic>, Arc<SubscriberQueue>)>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    published: AtomicU64,
    dropped_total: AtomicU64,
}

impl FanoutHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            published: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for a set of topics.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic_set: HashSet<Topic> = topics.iter().copied().collect();
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        lock_unpoisoned(&self.subscribers).insert(id, (topic_set.clone(), queue.clone()));
        debug!(subscriber = id, topics = ?topic_set, "Subscriber registered");
        Subscription {
            id,
            topics: topic_set,
            queue,
        }
    }

    /// Remove a subscriber. Safe to call repeatedly.
    pub fn unsubscribe(&self, id: u64) {
        if let Some((_, queue)) = lock_unpoisoned(&self.subscribers).remove(&id) {
            queue.close();
            debug!(subscriber = id, "Subscriber removed");
        }
    }

    /// Deliver a payload to every subscriber of `topic`. Never blocks.
    pub fn publish<T: Serialize>(&self, topic: Topic, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Unserializable payload, dropped");
                return;
            }
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = lock_unpoisoned(&self.subscribers);
        for (id, (topics, queue)) in subscribers.iter() {
            if !topics.contains(&topic) {
                continue;
            }
            let before = queue.dropped.load(Ordering::Relaxed);
            queue.push(Envelope {
                topic,
                payload: payload.clone(),
            });
            let dropped = queue.dropped.load(Ordering::Relaxed) - before;
            if dropped > 0 {
                self.dropped_total.fetch_add(dropped, Ordering::Relaxed);
                trace!(subscriber = id, topic = %topic, "Slow subscriber, oldest message dropped");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.subscribers).len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Total messages dropped across all subscribers.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
