//! # Bus Integration Tests
//!
//! Exercises the bus the way running nodes use it: several publishers and
//! subscribers on shared topics, consumers draining queues from their own
//! tasks while producers keep publishing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_bus::{CallbackResolver, MessageBus, PriorityQueue};
use fleet_telemetry::{EventKind, MemorySink};
use fleet_types::{BusError, FieldSpec, FieldType, History, MessageSchema, QosProfile};
use serde_json::json;
use tokio::time::timeout;

struct Table(HashSet<String>);

impl CallbackResolver for Table {
    fn has_callback(&self, callback_id: &str) -> bool {
        self.0.contains(callback_id)
    }
}

fn table(ids: &[&str]) -> Table {
    Table(ids.iter().map(|s| s.to_string()).collect())
}

fn utterance_schema() -> MessageSchema {
    MessageSchema::any()
        .field("text", FieldSpec::new(FieldType::String).required())
        .field(
            "priority",
            FieldSpec::new(FieldType::Integer)
                .bounded(Some(0.0), Some(100.0))
                .with_default(json!(50)),
        )
}

/// Undeclared publish is rejected and nothing reaches any subscriber.
#[tokio::test]
async fn test_undeclared_publish_has_zero_deliveries() {
    let sink = MemorySink::new();
    let bus = MessageBus::new(Arc::new(sink.clone()));
    bus.declare_publisher("transcriber", "speech.out", QosProfile::default(), utterance_schema())
        .expect("declare publisher");
    let queue = bus
        .declare_subscriber("speech", "speech.out", QosProfile::default(), "on_text", &table(&["on_text"]))
        .expect("declare subscriber");

    let result = bus.publish("sensor", "speech.out", json!({ "text": "hi" }));
    assert!(matches!(result, Err(BusError::UndeclaredTopic { .. })));
    assert!(queue.is_empty());
    assert_eq!(bus.stats().delivered, 0);
    assert_eq!(sink.count(EventKind::PublishRejected), 1);
}

/// A conforming publish puts exactly one entry in each bound queue.
#[tokio::test]
async fn test_conforming_publish_one_entry_per_subscriber() {
    let bus = MessageBus::default();
    bus.declare_publisher("transcriber", "speech.out", QosProfile::reliable(8), utterance_schema())
        .expect("declare publisher");
    let callbacks = table(&["on_text"]);
    let speaker = bus
        .declare_subscriber("speech", "speech.out", QosProfile::reliable(8), "on_text", &callbacks)
        .expect("bind speech");
    let logger = bus
        .declare_subscriber("logger", "speech.out", QosProfile::reliable(8), "on_text", &callbacks)
        .expect("bind logger");

    let receipt = bus
        .publish("transcriber", "speech.out", json!({ "text": "hello" }))
        .expect("publish");

    assert_eq!(receipt.delivered, 2);
    for queue in [&speaker, &logger] {
        assert_eq!(queue.len(), 1);
        let message = queue.try_pop().expect("message");
        assert_eq!(message.str_field("text"), Some("hello"));
        assert_eq!(message.i64_field("priority"), Some(50));
        assert_eq!(message.id, receipt.message_id);
    }
}

/// keep_last depth 1: M1 then M2 leaves only M2.
#[tokio::test]
async fn test_keep_last_leaves_latest_only() {
    let bus = MessageBus::default();
    bus.declare_publisher("sensor", "audio.level", QosProfile::latest(), MessageSchema::any())
        .expect("declare publisher");
    let queue = bus
        .declare_subscriber(
            "monitor",
            "audio.level",
            QosProfile::best_effort(1).with_history(History::KeepLast),
            "on_level",
            &table(&["on_level"]),
        )
        .expect("bind");

    bus.publish("sensor", "audio.level", json!({ "m": 1 })).expect("M1");
    bus.publish("sensor", "audio.level", json!({ "m": 2 })).expect("M2");

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.try_pop().and_then(|m| m.i64_field("m")), Some(2));
}

/// A schema conflict from a second node leaves the first contract intact.
#[tokio::test]
async fn test_schema_conflict_between_nodes() {
    let bus = MessageBus::default();
    bus.declare_publisher("a", "status", QosProfile::default(), MessageSchema::any())
        .expect("first");
    let err = bus
        .declare_publisher("b", "status", QosProfile::default(), utterance_schema())
        .expect_err("conflict");
    assert!(matches!(err, BusError::SchemaConflict { ref owner, .. } if owner == "a"));

    assert!(bus.publish("a", "status", json!({ "ok": true })).is_ok());
    assert!(bus.publish("b", "status", json!({ "ok": true })).is_err());
}

/// Per producer/topic/subscriber order is publish order under a live consumer.
#[tokio::test]
async fn test_order_preserved_with_concurrent_consumer() {
    let bus = Arc::new(MessageBus::default());
    bus.declare_publisher("sensor", "samples", QosProfile::reliable(1024), MessageSchema::any())
        .expect("declare");
    let queue = bus
        .declare_subscriber("sink", "samples", QosProfile::reliable(1024), "on_sample", &table(&["on_sample"]))
        .expect("bind");

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 200 {
                match queue.recv().await {
                    Some(message) => seen.push(message.i64_field("seq").unwrap_or(-1)),
                    None => break,
                }
            }
            seen
        })
    };

    for seq in 0..200 {
        bus.publish("sensor", "samples", json!({ "seq": seq })).expect("publish");
        if seq % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let seen = timeout(Duration::from_secs(2), consumer)
        .await
        .expect("consumer timed out")
        .expect("consumer panicked");
    assert_eq!(seen, (0..200).collect::<Vec<i64>>());
}

/// A slow consumer never blocks the publisher; overflow is counted.
#[tokio::test]
async fn test_publish_never_blocks_on_full_queue() {
    let sink = MemorySink::new();
    let bus = MessageBus::new(Arc::new(sink.clone()));
    bus.declare_publisher("sensor", "samples", QosProfile::reliable(4), MessageSchema::any())
        .expect("declare");
    let queue = bus
        .declare_subscriber("slow", "samples", QosProfile::reliable(4), "cb", &table(&["cb"]))
        .expect("bind");

    let publishing = async {
        for seq in 0..10 {
            bus.publish("sensor", "samples", json!({ "seq": seq })).expect("publish");
        }
    };
    timeout(Duration::from_millis(100), publishing)
        .await
        .expect("publish blocked");

    assert_eq!(queue.len(), 4);
    assert_eq!(bus.stats().reliable_drops, 6);
    assert_eq!(sink.count(EventKind::QueueOverflow), 6);
    // oldest four survive, newest were refused
    assert_eq!(queue.try_pop().and_then(|m| m.i64_field("seq")), Some(0));
}

/// Unregistering closes the node's queues and wakes its consumer.
#[tokio::test]
async fn test_unregister_wakes_consumer() {
    let bus = Arc::new(MessageBus::default());
    let queue = bus
        .declare_subscriber("listener", "t", QosProfile::default(), "cb", &table(&["cb"]))
        .expect("bind");

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.recv().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.unregister_node("listener");

    let received = timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer not woken")
        .expect("consumer panicked");
    assert!(received.is_none());
    assert!(bus.registry().topics().is_empty());
}

/// Priorities [50, 10, 80] come out as [10, 50, 80].
#[tokio::test]
async fn test_priority_queue_dequeue_order() {
    let queue = PriorityQueue::new(true);
    queue.push("normal", 50);
    queue.push("urgent", 10);
    queue.push("chatter", 80);

    let mut order = Vec::new();
    for _ in 0..3 {
        let delivery = timeout(Duration::from_millis(100), queue.recv())
            .await
            .expect("item available");
        order.push(delivery.priority);
        queue.complete();
    }
    assert_eq!(order, vec![10, 50, 80]);
}

/// A subscriber that rebinds after a restart gets the retained history of a
/// persistent topic, and nothing older than the contract depth.
#[tokio::test]
async fn test_persistent_topic_replays_to_late_joiner() {
    let bus = MessageBus::default();
    bus.declare_publisher("mapper", "map.tiles", QosProfile::persistent(3), MessageSchema::any())
        .expect("declare publisher");
    for n in 0..5 {
        bus.publish("mapper", "map.tiles", json!({ "n": n })).expect("publish");
    }

    let queue = bus
        .declare_subscriber("planner", "map.tiles", QosProfile::persistent(8), "on_tile", &table(&["on_tile"]))
        .expect("declare subscriber");
    let replayed: Vec<i64> = std::iter::from_fn(|| queue.try_pop())
        .filter_map(|m| m.i64_field("n"))
        .collect();
    assert_eq!(replayed, vec![2, 3, 4]);

    bus.unregister_node("planner");
    bus.publish("mapper", "map.tiles", json!({ "n": 5 })).expect("publish");
    let rebound = bus
        .declare_subscriber("planner", "map.tiles", QosProfile::persistent(8), "on_tile", &table(&["on_tile"]))
        .expect("rebind subscriber");
    assert_eq!(rebound.len(), 3);
    assert_eq!(rebound.try_pop().and_then(|m| m.i64_field("n")), Some(3));
}

/// Volatile topics start late joiners empty.
#[tokio::test]
async fn test_volatile_topic_has_no_replay() {
    let bus = MessageBus::default();
    bus.declare_publisher("sensor", "frames", QosProfile::default(), MessageSchema::any())
        .expect("declare publisher");
    bus.publish("sensor", "frames", json!({})).expect("publish");

    let queue = bus
        .declare_subscriber("late", "frames", QosProfile::default(), "on_frame", &table(&["on_frame"]))
        .expect("declare subscriber");
    assert!(queue.is_empty());
}

/// Declarations made while other nodes are being unregistered stay usable.
#[test]
fn test_declare_then_publish_during_concurrent_unregister() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let bus = Arc::new(MessageBus::default());
    let done = Arc::new(AtomicBool::new(false));
    let churn: Vec<_> = (0..3)
        .map(|_| {
            let bus = bus.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    bus.unregister_node("restarting");
                }
            })
        })
        .collect();

    let mut failures = 0;
    for i in 0..20_000 {
        let topic = format!("topic.{i}");
        bus.declare_publisher("p", &topic, QosProfile::default(), MessageSchema::any())
            .expect("declare publisher");
        if bus.publish("p", &topic, json!({})).is_err() {
            failures += 1;
        }
        bus.unregister_node("p");
    }

    done.store(true, Ordering::Relaxed);
    for handle in churn {
        handle.join().expect("churn thread panicked");
    }
    assert_eq!(failures, 0);
}
