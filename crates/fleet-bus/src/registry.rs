//! # Topic Registry
//!
//! Per topic: the publish contract (QoS and schema fixed by the first
//! publisher), the set of declared publishers, the bound subscriber queues and,
//! for `persistent` contracts, the last `depth` messages for late joiners.
//!
//! The map is behind a read/write lock that is only taken for writing when a
//! topic appears or disappears. Each entry has its own mutex, so fan-out on
//! one topic never contends with another. Declarations mutate an entry while
//! holding the map lock, so `remove_node` cannot evict an entry between its
//! lookup and its mutation.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use fleet_types::{BusError, Durability, Message, MessageSchema, QosProfile};
use parking_lot::{Mutex, RwLock};

use crate::queue::{PushOutcome, SubscriberQueue};

/// QoS and schema every publisher of a topic must agree on.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishContract {
    /// Node whose declaration fixed the contract.
    pub owner: String,
    pub qos: QosProfile,
    pub schema: MessageSchema,
}

/// Registry state for one topic.
#[derive(Debug, Default)]
pub struct TopicEntry {
    pub contract: Option<PublishContract>,
    pub publishers: BTreeSet<String>,
    pub subscribers: Vec<Arc<SubscriberQueue>>,
    /// History kept for late subscribers of a `persistent` contract.
    pub retained: VecDeque<Message>,
}

impl TopicEntry {
    fn is_unused(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }

    /// Subscribers whose QoS expectation the contract does not meet.
    pub fn qos_mismatches(&self) -> Vec<(String, String)> {
        let Some(contract) = &self.contract else {
            return Vec::new();
        };
        self.subscribers
            .iter()
            .filter_map(|q| {
                q.qos()
                    .mismatch_with(&contract.qos)
                    .map(|reason| (q.node().to_string(), reason))
            })
            .collect()
    }

    /// Keep `message` for late joiners if the contract is `persistent`.
    pub fn retain(&mut self, message: &Message) {
        let Some(contract) = &self.contract else {
            return;
        };
        if contract.qos.durability != Durability::Persistent {
            return;
        }
        let depth = contract.qos.effective_depth();
        while self.retained.len() >= depth {
            self.retained.pop_front();
        }
        self.retained.push_back(message.clone());
    }

    fn release_contract(&mut self) {
        self.contract = None;
        self.retained.clear();
    }
}

/// Outcome of a publisher declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherDeclared {
    /// `false` when the same node had already declared the same contract.
    pub newly_added: bool,
    /// (subscriber, reason) pairs under-served by the contract.
    pub mismatches: Vec<(String, String)>,
}

/// Outcome of a subscriber binding.
#[derive(Debug, Clone)]
pub struct SubscriberBound {
    /// The queue now bound, which is the earlier one if `node` already subscribed.
    pub queue: Arc<SubscriberQueue>,
    /// `false` when `node` already had a queue on the topic.
    pub newly_bound: bool,
    /// Why the contract under-serves the subscriber, if it does.
    pub mismatch: Option<String>,
    /// Retained messages copied into a freshly bound queue.
    pub replayed: usize,
}

/// Topic name to entry.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicEntry>>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the entry of `topic`, creating it if needed.
    ///
    /// The map lock (read for an existing topic, write for a new one) is held
    /// until `f` returns. A topic created here that `f` leaves unused is
    /// dropped again.
    fn with_entry<R>(&self, topic: &str, f: impl FnOnce(&mut TopicEntry) -> R) -> R {
        {
            let topics = self.topics.read();
            if let Some(entry) = topics.get(topic) {
                return f(&mut entry.lock());
            }
        }

        let mut topics = self.topics.write();
        let entry = topics.entry(topic.to_string()).or_default().clone();
        let mut entry = entry.lock();
        let result = f(&mut entry);
        if entry.is_unused() {
            topics.remove(topic);
        }
        result
    }

    /// Look up a topic without creating it.
    pub fn entry(&self, topic: &str) -> Option<Arc<Mutex<TopicEntry>>> {
        self.topics.read().get(topic).cloned()
    }

    /// Register `node` as a publisher of `topic`.
    ///
    /// The first publisher fixes the contract. Any later declaration, from
    /// any node, must match it exactly.
    pub fn declare_publisher(
        &self,
        node: &str,
        topic: &str,
        qos: QosProfile,
        schema: MessageSchema,
    ) -> Result<PublisherDeclared, BusError> {
        self.with_entry(topic, |entry| {
            match &entry.contract {
                Some(contract) if contract.qos != qos || contract.schema != schema => {
                    return Err(BusError::SchemaConflict {
                        topic: topic.to_string(),
                        owner: contract.owner.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    entry.contract = Some(PublishContract {
                        owner: node.to_string(),
                        qos,
                        schema,
                    });
                }
            }

            let newly_added = entry.publishers.insert(node.to_string());
            Ok(PublisherDeclared {
                newly_added,
                mismatches: if newly_added {
                    entry.qos_mismatches()
                } else {
                    Vec::new()
                },
            })
        })
    }

    /// Bind a subscriber queue, or return the queue `node` already has on the
    /// topic.
    ///
    /// A fresh queue receives the topic's retained history, skipping the
    /// node's own messages when `skip_own` is set.
    pub fn bind_subscriber(&self, queue: Arc<SubscriberQueue>, skip_own: bool) -> SubscriberBound {
        let topic = queue.topic().to_string();
        self.with_entry(&topic, |entry| {
            if let Some(existing) = entry
                .subscribers
                .iter()
                .find(|q| q.node() == queue.node())
            {
                return SubscriberBound {
                    queue: existing.clone(),
                    newly_bound: false,
                    mismatch: None,
                    replayed: 0,
                };
            }

            let mismatch = entry
                .contract
                .as_ref()
                .and_then(|c| queue.qos().mismatch_with(&c.qos));
            let replayed = entry
                .retained
                .iter()
                .filter(|m| !(skip_own && m.source == queue.node()))
                .filter(|m| queue.push((*m).clone()) != PushOutcome::Dropped)
                .count();
            entry.subscribers.push(queue.clone());
            SubscriberBound {
                queue,
                newly_bound: true,
                mismatch,
                replayed,
            }
        })
    }

    /// Whether `node` declared `topic` as a published topic.
    pub fn is_publisher(&self, node: &str, topic: &str) -> bool {
        self.entry(topic)
            .map(|e| e.lock().publishers.contains(node))
            .unwrap_or(false)
    }

    /// Current contract of a topic, if any publisher declared it.
    pub fn contract(&self, topic: &str) -> Option<PublishContract> {
        self.entry(topic).and_then(|e| e.lock().contract.clone())
    }

    /// Remove every publisher declaration and subscriber queue of `node`.
    ///
    /// Removed queues are closed. Returns how many queues were removed.
    pub fn remove_node(&self, node: &str) -> usize {
        let mut removed = 0;
        let mut topics = self.topics.write();
        topics.retain(|_, entry| {
            let mut entry = entry.lock();
            entry.publishers.remove(node);
            if entry.publishers.is_empty() {
                entry.release_contract();
            }
            entry.subscribers.retain(|q| {
                if q.node() == node {
                    q.close();
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            !entry.is_unused()
        });
        removed
    }

    /// Known topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every bound queue across all topics.
    pub fn queues(&self) -> Vec<Arc<SubscriberQueue>> {
        self.topics
            .read()
            .values()
            .flat_map(|e| e.lock().subscribers.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{FieldSpec, FieldType};
    use serde_json::json;

    fn text_schema() -> MessageSchema {
        MessageSchema::any().field("text", FieldSpec::new(FieldType::String).required())
    }

    #[test]
    fn test_first_publisher_fixes_contract() {
        let registry = TopicRegistry::new();
        let declared = registry
            .declare_publisher("a", "speech", QosProfile::default(), text_schema())
            .unwrap();
        assert!(declared.newly_added);
        assert_eq!(registry.contract("speech").unwrap().owner, "a");
    }

    #[test]
    fn test_redeclare_is_idempotent() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("a", "speech", QosProfile::default(), text_schema())
            .unwrap();
        let again = registry
            .declare_publisher("a", "speech", QosProfile::default(), text_schema())
            .unwrap();
        assert!(!again.newly_added);
    }

    #[test]
    fn test_conflicting_declaration_rejected() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("a", "speech", QosProfile::default(), text_schema())
            .unwrap();
        let err = registry
            .declare_publisher("b", "speech", QosProfile::latest(), text_schema())
            .unwrap_err();
        assert_eq!(
            err,
            BusError::SchemaConflict {
                topic: "speech".into(),
                owner: "a".into()
            }
        );
        assert!(!registry.is_publisher("b", "speech"));
    }

    #[test]
    fn test_second_publisher_with_same_contract_allowed() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("a", "speech", QosProfile::default(), text_schema())
            .unwrap();
        registry
            .declare_publisher("b", "speech", QosProfile::default(), text_schema())
            .unwrap();
        assert!(registry.is_publisher("b", "speech"));
    }

    #[test]
    fn test_bind_subscriber_is_idempotent_per_node() {
        let registry = TopicRegistry::new();
        let q1 = Arc::new(SubscriberQueue::new("s", "t", QosProfile::default(), "cb"));
        let q2 = Arc::new(SubscriberQueue::new("s", "t", QosProfile::default(), "cb"));
        let first = registry.bind_subscriber(q1, false);
        let second = registry.bind_subscriber(q2, false);
        assert!(first.newly_bound);
        assert!(!second.newly_bound);
        assert!(Arc::ptr_eq(&first.queue, &second.queue));
        assert_eq!(registry.queues().len(), 1);
    }

    #[test]
    fn test_bind_reports_qos_mismatch() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("p", "t", QosProfile::best_effort(5), MessageSchema::any())
            .unwrap();
        let q = Arc::new(SubscriberQueue::new("s", "t", QosProfile::reliable(5), "cb"));
        assert!(registry.bind_subscriber(q, false).mismatch.is_some());
    }

    #[test]
    fn test_remove_node_forgets_unused_topics() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("p", "t", QosProfile::default(), MessageSchema::any())
            .unwrap();
        let q = Arc::new(SubscriberQueue::new("s", "t", QosProfile::default(), "cb"));
        registry.bind_subscriber(q.clone(), false);

        assert_eq!(registry.remove_node("s"), 1);
        assert!(q.is_closed());
        assert_eq!(registry.topics(), vec!["t".to_string()]);

        registry.remove_node("p");
        assert!(registry.topics().is_empty());
        assert!(registry.contract("t").is_none());
    }

    #[test]
    fn test_persistent_contract_retains_depth_messages() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("p", "map", QosProfile::persistent(2), MessageSchema::any())
            .unwrap();
        let entry = registry.entry("map").unwrap();
        for id in 1..=3 {
            entry.lock().retain(&Message::new(id, "map", "p", json!({ "n": id })));
        }
        let kept: Vec<u64> = entry.lock().retained.iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![2, 3]);

        let late = Arc::new(SubscriberQueue::new("s", "map", QosProfile::persistent(5), "cb"));
        let bound = registry.bind_subscriber(late.clone(), false);
        assert_eq!(bound.replayed, 2);
        assert_eq!(late.try_pop().unwrap().id, 2);
        assert_eq!(late.try_pop().unwrap().id, 3);

        registry.remove_node("p");
        assert!(registry.entry("map").unwrap().lock().retained.is_empty());
    }

    #[test]
    fn test_volatile_contract_retains_nothing() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("p", "t", QosProfile::default(), MessageSchema::any())
            .unwrap();
        let entry = registry.entry("t").unwrap();
        entry.lock().retain(&Message::new(1, "t", "p", json!({})));
        assert!(entry.lock().retained.is_empty());
    }

    #[test]
    fn test_replay_skips_own_messages_when_asked() {
        let registry = TopicRegistry::new();
        registry
            .declare_publisher("p", "t", QosProfile::persistent(4), MessageSchema::any())
            .unwrap();
        let entry = registry.entry("t").unwrap();
        entry.lock().retain(&Message::new(1, "t", "p", json!({})));

        let own = Arc::new(SubscriberQueue::new("p", "t", QosProfile::persistent(4), "cb"));
        assert_eq!(registry.bind_subscriber(own, true).replayed, 0);
    }

    #[test]
    fn test_declarations_survive_concurrent_removals() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(TopicRegistry::new());
        let done = Arc::new(AtomicBool::new(false));
        let removers: Vec<_> = (0..3)
            .map(|_| {
                let registry = registry.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        registry.remove_node("someone_else");
                    }
                })
            })
            .collect();

        let mut lost = 0;
        for i in 0..20_000 {
            let topic = format!("t{i}");
            registry
                .declare_publisher("p", &topic, QosProfile::default(), MessageSchema::any())
                .unwrap();
            if !registry.is_publisher("p", &topic) {
                lost += 1;
            }
            let queue = Arc::new(SubscriberQueue::new("s", topic.as_str(), QosProfile::default(), "cb"));
            registry.bind_subscriber(queue.clone(), false);
            let bound = registry
                .entry(&topic)
                .is_some_and(|e| e.lock().subscribers.iter().any(|q| Arc::ptr_eq(q, &queue)));
            if !bound {
                lost += 1;
            }
            registry.remove_node("p");
            registry.remove_node("s");
        }

        done.store(true, Ordering::Relaxed);
        for remover in removers {
            remover.join().unwrap();
        }
        assert_eq!(lost, 0);
    }
}
