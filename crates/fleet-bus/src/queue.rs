//! # Subscriber Queue
//!
//! Bounded inbound buffer for one (node, topic) subscription.
//!
//! Capacity and overwrite behaviour come from the subscription's QoS:
//!
//! | History | On full |
//! |---------|---------|
//! | `keep_last` | evict the oldest entry, accept the new one |
//! | `keep_all` | refuse the new entry (newest is dropped) |
//!
//! `push` never blocks. The single consumer (the node's dispatch task) waits
//! on [`SubscriberQueue::recv`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fleet_types::{History, Message, QosProfile, Reliability};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Result of offering one message to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without loss.
    Enqueued,
    /// Appended after evicting the oldest entry (`keep_last`).
    Replaced,
    /// Refused because the queue was full (`keep_all`) or closed.
    Dropped,
}

/// Point-in-time counters of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub node: String,
    pub topic: String,
    pub len: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub replaced: u64,
    pub dropped: u64,
}

/// Bounded FIFO owned by the bus and drained by one dispatch task.
#[derive(Debug)]
pub struct SubscriberQueue {
    node: String,
    topic: String,
    qos: QosProfile,
    callback: String,
    buffer: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    replaced: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    /// Create a queue sized by the subscription's QoS.
    pub fn new(
        node: impl Into<String>,
        topic: impl Into<String>,
        qos: QosProfile,
        callback: impl Into<String>,
    ) -> Self {
        let capacity = qos.effective_depth();
        Self {
            node: node.into(),
            topic: topic.into(),
            qos,
            callback: callback.into(),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> &QosProfile {
        &self.qos
    }

    /// Callback id this queue is bound to.
    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub fn capacity(&self) -> usize {
        self.qos.effective_depth()
    }

    pub fn is_reliable(&self) -> bool {
        self.qos.reliability == Reliability::Reliable
    }

    /// Offer a message. Never blocks.
    pub fn push(&self, message: Message) -> PushOutcome {
        if self.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped;
        }

        let outcome = {
            let mut buffer = self.buffer.lock();
            if buffer.len() < self.capacity() {
                buffer.push_back(message);
                PushOutcome::Enqueued
            } else {
                match self.qos.history {
                    History::KeepLast => {
                        buffer.pop_front();
                        buffer.push_back(message);
                        PushOutcome::Replaced
                    }
                    History::KeepAll => PushOutcome::Dropped,
                }
            }
        };

        match outcome {
            PushOutcome::Enqueued => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            PushOutcome::Replaced => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.replaced.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            PushOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Take the oldest message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        self.buffer.lock().pop_front()
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            // notify_one stores a permit, so a push between the check and
            // the await is not lost.
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            node: self.node.clone(),
            topic: self.topic.clone(),
            len: self.len(),
            capacity: self.capacity(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
