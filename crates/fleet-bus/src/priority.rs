//! # Priority Queue
//!
//! Priority-ordered delivery with optional interruption of the in-flight item.
//!
//! Lower numeric priority is more urgent. Equal priorities pop in enqueue
//! order. When interruption is enabled, pushing an item strictly more urgent
//! than the one currently being processed cancels the in-flight item's token.
//!
//! This is a reusable primitive: a node keeps one inside its own state and
//! drives it from its callbacks and main loop.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
pub use tokio_util::sync::CancellationToken;

/// Queued item with its ordering key.
struct Entry<T> {
    priority: u32,
    enqueued_at: Instant,
    seq: u64,
    item: T,
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower priority value = more urgent (first in the set)
        self.priority
            .cmp(&other.priority)
            // Earlier enqueue first (FIFO for same priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            // Same Instant is possible on coarse clocks
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

/// An item handed out by [`PriorityQueue::pop`].
#[derive(Debug)]
pub struct Delivery<T> {
    pub item: T,
    pub priority: u32,
    pub enqueued_at: Instant,
    /// Cancelled if a more urgent item arrives while this one is in flight.
    pub token: CancellationToken,
}

struct State<T> {
    entries: BTreeSet<Entry<T>>,
    next_seq: u64,
    in_flight: Option<(u32, CancellationToken)>,
}

/// Priority-ordered, interruptible queue.
pub struct PriorityQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    interrupt_enabled: bool,
}

impl<T> PriorityQueue<T> {
    pub fn new(interrupt_enabled: bool) -> Self {
        Self {
            state: Mutex::new(State {
                entries: BTreeSet::new(),
                next_seq: 0,
                in_flight: None,
            }),
            notify: Notify::new(),
            interrupt_enabled,
        }
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.interrupt_enabled
    }

    /// Enqueue an item.
    ///
    /// Returns `true` if the in-flight item was interrupted.
    pub fn push(&self, item: T, priority: u32) -> bool {
        let interrupted = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(Entry {
                priority,
                enqueued_at: Instant::now(),
                seq,
                item,
            });

            match &state.in_flight {
                Some((current, token))
                    if self.interrupt_enabled && priority < *current && !token.is_cancelled() =>
                {
                    token.cancel();
                    true
                }
                _ => false,
            }
        };
        self.notify.notify_one();
        interrupted
    }

    /// Take the most urgent item and mark it in flight.
    pub fn pop(&self) -> Option<Delivery<T>> {
        let mut state = self.state.lock();
        let entry = state.entries.pop_first()?;
        let token = CancellationToken::new();
        state.in_flight = Some((entry.priority, token.clone()));
        Some(Delivery {
            item: entry.item,
            priority: entry.priority,
            enqueued_at: entry.enqueued_at,
            token,
        })
    }

    /// Wait for the next item.
    pub async fn recv(&self) -> Delivery<T> {
        loop {
            if let Some(delivery) = self.pop() {
                return delivery;
            }
            self.notify.notified().await;
        }
    }

    /// Clear the in-flight slot once the consumer is done with its item.
    pub fn complete(&self) {
        self.state.lock().in_flight = None;
    }

    /// Priority of the item currently being processed.
    pub fn in_flight_priority(&self) -> Option<u32> {
        self.state.lock().in_flight.as_ref().map(|(p, _)| *p)
    }

    /// Drop every queued item. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn drain(queue: &PriorityQueue<&'static str>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(d) = queue.pop() {
            out.push(d.priority);
            queue.complete();
        }
        out
    }

    #[test]
    fn test_pops_lowest_priority_first() {
        let queue = PriorityQueue::new(false);
        queue.push("a", 50);
        queue.push("b", 10);
        queue.push("c", 80);
        assert_eq!(drain(&queue), vec![10, 50, 80]);
    }

    #[test]
    fn test_equal_priorities_fifo() {
        let queue = PriorityQueue::new(false);
        queue.push("first", 5);
        queue.push("second", 5);
        queue.push("third", 5);
        let items: Vec<&str> = std::iter::from_fn(|| queue.pop()).map(|d| d.item).collect();
        assert_eq!(items, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_more_urgent_item_interrupts() {
        let queue = PriorityQueue::new(true);
        queue.push("chatter", 50);
        let current = queue.pop().unwrap();

        assert!(!queue.push("later", 80));
        assert!(!queue.push("same", 50));
        assert!(!current.token.is_cancelled());

        assert!(queue.push("alarm", 10));
        assert!(current.token.is_cancelled());
    }

    #[test]
    fn test_interruption_disabled() {
        let queue = PriorityQueue::new(false);
        queue.push("chatter", 50);
        let current = queue.pop().unwrap();
        assert!(!queue.push("alarm", 10));
        assert!(!current.token.is_cancelled());
    }

    #[test]
    fn test_no_interrupt_after_complete() {
        let queue = PriorityQueue::new(true);
        queue.push("chatter", 50);
        let current = queue.pop().unwrap();
        queue.complete();
        assert!(!queue.push("alarm", 10));
        assert!(!current.token.is_cancelled());
        assert_eq!(queue.in_flight_priority(), None);
    }

    #[test]
    fn test_clear() {
        let queue = PriorityQueue::default();
        queue.push(1, 1);
        queue.push(2, 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let queue = Arc::new(PriorityQueue::new(true));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await.item })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("hello", 3);
        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("recv timed out")
            .expect("task panicked");
        assert_eq!(item, "hello");
    }
}
