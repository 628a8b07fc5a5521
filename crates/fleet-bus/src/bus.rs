//! # Message Bus
//!
//! Routes published messages to every subscriber queue bound to the topic.
//!
//! The bus enforces the declared contracts: a node may only publish on topics
//! it declared, payloads must satisfy the topic schema, and a subscription is
//! only bound when the node can resolve its callback. Delivery never blocks
//! the publisher; overflow is counted and reported to the event sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_telemetry::{
    DynEventSink, EventKind, TracingSink, BUS_DROPS_BEST_EFFORT, BUS_DROPS_RELIABLE,
    BUS_KEEP_LAST_REPLACED, BUS_MESSAGES_DELIVERED, BUS_MESSAGES_PUBLISHED, BUS_PUBLISH_REJECTED,
};
use fleet_types::{BusError, DeliveryWarning, Message, MessageId, MessageSchema, QosProfile};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::queue::{PushOutcome, QueueStats, SubscriberQueue};
use crate::registry::TopicRegistry;

/// Lets the bus check a callback id before binding a subscription.
pub trait CallbackResolver {
    fn has_callback(&self, callback_id: &str) -> bool;
}

/// Result of an accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    /// Queues that accepted the message (including keep_last replacements).
    pub delivered: usize,
    /// Queues that refused it.
    pub dropped: usize,
}

/// Bus-wide counters plus per-queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub best_effort_drops: u64,
    pub reliable_drops: u64,
    pub replaced: u64,
    pub queues: Vec<QueueStats>,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    best_effort_drops: AtomicU64,
    reliable_drops: AtomicU64,
    replaced: AtomicU64,
}

/// In-process message bus.
pub struct MessageBus {
    registry: TopicRegistry,
    next_id: AtomicU64,
    sink: DynEventSink,
    suppress_self_delivery: bool,
    counters: BusCounters,
}

impl MessageBus {
    /// Create a bus reporting to `sink`.
    pub fn new(sink: DynEventSink) -> Self {
        Self {
            registry: TopicRegistry::new(),
            next_id: AtomicU64::new(1),
            sink,
            suppress_self_delivery: false,
            counters: BusCounters::default(),
        }
    }

    /// Skip delivery of a node's own publications to its own subscriptions.
    #[must_use]
    pub fn with_self_delivery_suppressed(mut self, suppress: bool) -> Self {
        self.suppress_self_delivery = suppress;
        self
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &DynEventSink {
        &self.sink
    }

    /// Declare `node` as a publisher of `topic`.
    pub fn declare_publisher(
        &self,
        node: &str,
        topic: &str,
        qos: QosProfile,
        schema: MessageSchema,
    ) -> Result<(), BusError> {
        let declared = self
            .registry
            .declare_publisher(node, topic, qos, schema)
            .inspect_err(|e| {
                self.sink
                    .record_event(EventKind::PublishRejected, node, &e.to_string());
            })?;

        for (subscriber, reason) in declared.mismatches {
            self.sink.record_event(
                EventKind::QosMismatch,
                &subscriber,
                &format!("topic '{topic}': {reason}"),
            );
        }
        if declared.newly_added {
            debug!(node = %node, topic = %topic, "Publisher declared");
        }
        Ok(())
    }

    /// Bind a subscription of `node` on `topic`.
    ///
    /// Fails with `UnknownCallback` if `resolver` cannot resolve
    /// `callback_id`. Redeclaring returns the queue already bound.
    pub fn declare_subscriber(
        &self,
        node: &str,
        topic: &str,
        qos: QosProfile,
        callback_id: &str,
        resolver: &dyn CallbackResolver,
    ) -> Result<Arc<SubscriberQueue>, BusError> {
        if !resolver.has_callback(callback_id) {
            return Err(BusError::UnknownCallback {
                node: node.to_string(),
                topic: topic.to_string(),
                callback: callback_id.to_string(),
            });
        }

        let queue = Arc::new(SubscriberQueue::new(node, topic, qos, callback_id));
        let bound = self
            .registry
            .bind_subscriber(queue, self.suppress_self_delivery);
        if let Some(reason) = &bound.mismatch {
            self.sink.record_event(
                EventKind::QosMismatch,
                node,
                &format!("topic '{topic}': {reason}"),
            );
        }
        if bound.newly_bound {
            debug!(
                node = %node,
                topic = %topic,
                callback = %callback_id,
                depth = bound.queue.capacity(),
                replayed = bound.replayed,
                "Subscriber bound"
            );
        }
        Ok(bound.queue)
    }

    /// Publish `payload` on `topic` as `node`.
    pub fn publish(&self, node: &str, topic: &str, payload: Value) -> Result<PublishReceipt, BusError> {
        let Some(entry) = self.registry.entry(topic) else {
            return Err(self.reject_undeclared(node, topic));
        };

        let mut warnings = Vec::new();
        let receipt = {
            let mut entry = entry.lock();
            if !entry.publishers.contains(node) {
                drop(entry);
                return Err(self.reject_undeclared(node, topic));
            }
            let Some(contract) = &entry.contract else {
                drop(entry);
                return Err(self.reject_undeclared(node, topic));
            };

            let payload = match contract.schema.validate(payload) {
                Ok(payload) => payload,
                Err(violation) => {
                    drop(entry);
                    return Err(self.reject_schema(node, topic, violation));
                }
            };

            let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let message = Message::new(message_id, topic, node, payload);
            entry.retain(&message);
            let mut receipt = PublishReceipt {
                message_id,
                delivered: 0,
                dropped: 0,
            };

            for queue in &entry.subscribers {
                if self.suppress_self_delivery && queue.node() == node {
                    continue;
                }
                let outcome = queue.push(message.clone());
                if outcome != PushOutcome::Dropped {
                    BUS_MESSAGES_DELIVERED
                        .with_label_values(&[topic, queue.node()])
                        .inc();
                }
                match outcome {
                    PushOutcome::Enqueued => receipt.delivered += 1,
                    PushOutcome::Replaced => {
                        receipt.delivered += 1;
                        warnings.push((
                            queue.clone(),
                            DeliveryWarning::Replaced {
                                topic: topic.to_string(),
                                subscriber: queue.node().to_string(),
                            },
                        ));
                    }
                    PushOutcome::Dropped => {
                        receipt.dropped += 1;
                        warnings.push((
                            queue.clone(),
                            DeliveryWarning::QueueOverflow {
                                topic: topic.to_string(),
                                subscriber: queue.node().to_string(),
                                reliable: queue.is_reliable(),
                            },
                        ));
                    }
                }
            }
            receipt
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(receipt.delivered as u64, Ordering::Relaxed);
        BUS_MESSAGES_PUBLISHED.with_label_values(&[topic]).inc();

        for (queue, warning) in warnings {
            self.report_delivery_warning(&queue, warning);
        }

        trace!(
            node = %node,
            topic = %topic,
            message_id = receipt.message_id,
            delivered = receipt.delivered,
            dropped = receipt.dropped,
            "Message published"
        );
        Ok(receipt)
    }

    fn reject_undeclared(&self, node: &str, topic: &str) -> BusError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        BUS_PUBLISH_REJECTED
            .with_label_values(&[topic, "undeclared"])
            .inc();
        let err = BusError::UndeclaredTopic {
            node: node.to_string(),
            topic: topic.to_string(),
        };
        self.sink
            .record_event(EventKind::PublishRejected, node, &err.to_string());
        err
    }

    fn reject_schema(
        &self,
        node: &str,
        topic: &str,
        violation: fleet_types::SchemaViolation,
    ) -> BusError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        BUS_PUBLISH_REJECTED.with_label_values(&[topic, "schema"]).inc();
        let err = BusError::SchemaViolation {
            topic: topic.to_string(),
            violation,
        };
        self.sink
            .record_event(EventKind::PublishRejected, node, &err.to_string());
        err
    }

    fn report_delivery_warning(&self, queue: &SubscriberQueue, warning: DeliveryWarning) {
        let labels = [queue.topic(), queue.node()];
        let kind = match &warning {
            DeliveryWarning::Replaced { .. } => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                BUS_KEEP_LAST_REPLACED.with_label_values(&labels).inc();
                EventKind::KeepLastReplaced
            }
            DeliveryWarning::QueueOverflow { reliable: true, .. } => {
                self.counters.reliable_drops.fetch_add(1, Ordering::Relaxed);
                BUS_DROPS_RELIABLE.with_label_values(&labels).inc();
                EventKind::QueueOverflow
            }
            DeliveryWarning::QueueOverflow { reliable: false, .. } => {
                self.counters
                    .best_effort_drops
                    .fetch_add(1, Ordering::Relaxed);
                BUS_DROPS_BEST_EFFORT.with_label_values(&labels).inc();
                EventKind::BestEffortDrop
            }
        };
        self.sink
            .record_event(kind, queue.node(), &warning.to_string());
    }

    /// Remove all declarations and queues of `node`. Idempotent.
    pub fn unregister_node(&self, node: &str) {
        let removed = self.registry.remove_node(node);
        debug!(node = %node, queues = removed, "Node unregistered from bus");
    }

    pub fn stats(&self) -> BusStats {
        let mut queues: Vec<QueueStats> =
            self.registry.queues().iter().map(|q| q.stats()).collect();
        queues.sort_by(|a, b| (&a.topic, &a.node).cmp(&(&b.topic, &b.node)));
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            best_effort_drops: self.counters.best_effort_drops.load(Ordering::Relaxed),
            reliable_drops: self.counters.reliable_drops.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            queues,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}
