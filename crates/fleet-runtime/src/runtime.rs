//! # Node Runtime
//!
//! Per-node wrapper between a node and the bus.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──→ context() ──→ node.init() ──→ init_messages() ──→ start_dispatch()
//!                                                                   │
//!                                                         teardown() ┘
//! ```
//!
//! `init_messages` declares the node's published topics and binds each
//! subscription to a callback from the table the node filled during `init`.
//! A node gets one subscription per topic. `start_dispatch` spawns one task
//! per bound subscription. A failing or panicking callback is reported and
//! never stops any dispatch path.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use fleet_bus::{MessageBus, SubscriberQueue};
use fleet_telemetry::{DynEventSink, EventKind, HistogramTimer, CALLBACK_DURATION, CALLBACK_FAILURES};
use fleet_types::{BusError, Message, TopicDeclarations};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::{BusHandle, Callback, CallbackTable, NodeContext};

/// What `init_messages` bound and what it dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub published: Vec<String>,
    pub subscribed: Vec<String>,
    /// (topic, callback id) pairs dropped for an unknown callback or a
    /// second subscription on the same topic.
    pub dropped: Vec<(String, String)>,
}

struct Binding {
    queue: Arc<SubscriberQueue>,
    callback: Callback,
}

/// Registration and dispatch for one node.
pub struct NodeRuntime {
    name: String,
    bus: Arc<MessageBus>,
    sink: DynEventSink,
    declarations: TopicDeclarations,
    poll_interval: Duration,
    bindings: Vec<Binding>,
    dispatch: JoinSet<()>,
    shutdown: CancellationToken,
}

impl NodeRuntime {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<MessageBus>,
        declarations: TopicDeclarations,
        poll_interval: Duration,
    ) -> Self {
        let sink = bus.sink().clone();
        Self {
            name: name.into(),
            bus,
            sink,
            declarations,
            poll_interval,
            bindings: Vec::new(),
            dispatch: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Derive the shutdown signal from `parent`, so cancelling `parent` also
    /// shuts this runtime down. Call before [`Self::context`].
    #[must_use]
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context handed to the node.
    pub fn context(&self, environment: BTreeMap<String, String>) -> NodeContext {
        NodeContext::new(
            self.name.clone(),
            environment,
            BusHandle::new(self.name.clone(), self.bus.clone()),
            self.shutdown.clone(),
        )
    }

    /// Declare publications and bind subscriptions.
    ///
    /// In strict mode an unknown callback fails with `UnknownCallback` and a
    /// second subscription on an already subscribed topic with
    /// `DuplicateSubscription`; otherwise the subscription is dropped and an
    /// init warning recorded.
    pub fn init_messages(
        &mut self,
        callbacks: &CallbackTable,
        strict: bool,
    ) -> Result<InitReport, BusError> {
        let mut report = InitReport::default();

        for decl in &self.declarations.publishes {
            self.bus.declare_publisher(
                &self.name,
                &decl.topic,
                decl.qos,
                decl.schema.clone(),
            )?;
            report.published.push(decl.topic.clone());
        }

        // topic -> callback id of the subscription already bound
        let mut bound: HashMap<String, String> = HashMap::new();
        for decl in &self.declarations.subscribes {
            let callback_id = decl.callback.clone().unwrap_or_default();

            let result = match bound.get(&decl.topic) {
                Some(existing) if *existing == callback_id => {
                    debug!(node = %self.name, topic = %decl.topic, "Repeated subscription ignored");
                    continue;
                }
                Some(existing) => Err(BusError::DuplicateSubscription {
                    node: self.name.clone(),
                    topic: decl.topic.clone(),
                    existing: existing.clone(),
                }),
                None => self.bus.declare_subscriber(
                    &self.name,
                    &decl.topic,
                    decl.qos,
                    &callback_id,
                    callbacks,
                ),
            };

            let queue = match result {
                Ok(queue) => queue,
                Err(
                    err @ (BusError::UnknownCallback { .. }
                    | BusError::DuplicateSubscription { .. }),
                ) => {
                    if strict {
                        return Err(err);
                    }
                    self.sink.record_event(
                        EventKind::InitWarning,
                        &self.name,
                        &format!("subscription dropped: {err}"),
                    );
                    report.dropped.push((decl.topic.clone(), callback_id));
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(callback) = callbacks.get(&callback_id) else {
                continue;
            };
            bound.insert(decl.topic.clone(), callback_id);
            report.subscribed.push(decl.topic.clone());
            self.bindings.push(Binding { queue, callback });
        }

        debug!(
            node = %self.name,
            published = report.published.len(),
            subscribed = report.subscribed.len(),
            dropped = report.dropped.len(),
            "Messages initialised"
        );
        Ok(report)
    }

    /// Spawn one consumption task per bound subscription.
    pub fn start_dispatch(&mut self) {
        for binding in &self.bindings {
            self.dispatch.spawn(dispatch_loop(
                self.name.clone(),
                binding.queue.clone(),
                binding.callback.clone(),
                self.shutdown.clone(),
                self.sink.clone(),
            ));
        }
    }

    /// Number of dispatch tasks not yet reaped by [`Self::teardown`].
    pub fn dispatch_count(&self) -> usize {
        self.dispatch.len()
    }

    /// Cancel the node's shutdown token.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop dispatch and unregister from the bus.
    ///
    /// All dispatch tasks share one grace period of two poll intervals;
    /// stragglers are aborted and detached.
    pub async fn teardown(&mut self) {
        self.signal_shutdown();
        self.bus.unregister_node(&self.name);

        let grace = self.poll_interval * 2;
        let dispatch = &mut self.dispatch;
        let drained = tokio::time::timeout(grace, async {
            while dispatch.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(node = %self.name, stragglers = self.dispatch.len(), "Dispatch tasks aborted");
            self.dispatch.abort_all();
            self.dispatch.detach_all();
        }
        self.bindings.clear();
        info!(node = %self.name, "Runtime torn down");
    }
}

async fn dispatch_loop(
    node: String,
    queue: Arc<SubscriberQueue>,
    callback: Callback,
    shutdown: CancellationToken,
    sink: DynEventSink,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => invoke(&node, &callback, &message, &sink),
                None => break,
            },
        }
    }
    debug!(node = %node, topic = %queue.topic(), "Dispatch loop exited");
}

fn invoke(node: &str, callback: &Callback, message: &Message, sink: &DynEventSink) {
    let _timer = HistogramTimer::new(&CALLBACK_DURATION);
    let failure = match catch_unwind(AssertUnwindSafe(|| callback(message))) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("callback panicked: {}", panic_message(panic.as_ref())),
    };
    CALLBACK_FAILURES
        .with_label_values(&[node, message.topic.as_str()])
        .inc();
    sink.record_event(
        EventKind::CallbackFailed,
        node,
        &format!("topic '{}' message {}: {}", message.topic, message.id, failure),
    );
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeError;
    use fleet_telemetry::MemorySink;
    use fleet_types::{MessageSchema, QosProfile};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus_with_sink() -> (Arc<MessageBus>, MemorySink) {
        let sink = MemorySink::new();
        (Arc::new(MessageBus::new(Arc::new(sink.clone()))), sink)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_missing_callback_dropped_when_lenient() {
        let (bus, sink) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a")
            .subscribe("b", MessageSchema::any(), QosProfile::default(), "on_b");
        let mut runtime = NodeRuntime::new("n", bus, decls, Duration::from_millis(20));
        let mut table = CallbackTable::new();
        table.register("on_a", |_| Ok(()));

        let report = runtime.init_messages(&table, false).unwrap();
        assert_eq!(report.subscribed, vec!["a".to_string()]);
        assert_eq!(report.dropped, vec![("b".to_string(), "on_b".to_string())]);
        assert_eq!(sink.count(EventKind::InitWarning), 1);
    }

    #[test]
    fn test_missing_callback_fatal_when_strict() {
        let (bus, _) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .subscribe("b", MessageSchema::any(), QosProfile::default(), "on_b");
        let mut runtime = NodeRuntime::new("n", bus, decls, Duration::from_millis(20));

        let err = runtime.init_messages(&CallbackTable::new(), true).unwrap_err();
        assert!(matches!(err, BusError::UnknownCallback { .. }));
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_stop_other_paths() {
        let (bus, sink) = bus_with_sink();
        bus.declare_publisher("p", "bad", QosProfile::default(), MessageSchema::any())
            .unwrap();
        bus.declare_publisher("p", "good", QosProfile::default(), MessageSchema::any())
            .unwrap();

        let decls = TopicDeclarations::new()
            .subscribe("bad", MessageSchema::any(), QosProfile::default(), "on_bad")
            .subscribe("good", MessageSchema::any(), QosProfile::default(), "on_good");
        let mut runtime = NodeRuntime::new("n", bus.clone(), decls, Duration::from_millis(20));

        let good_hits = Arc::new(AtomicUsize::new(0));
        let mut table = CallbackTable::new();
        table.register("on_bad", |msg| {
            if msg.i64_field("n") == Some(1) {
                panic!("boom");
            }
            Err(NodeError::Callback("rejected".into()))
        });
        {
            let good_hits = good_hits.clone();
            table.register("on_good", move |_| {
                good_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        runtime.init_messages(&table, false).unwrap();
        runtime.start_dispatch();

        bus.publish("p", "bad", json!({ "n": 1 })).unwrap();
        bus.publish("p", "bad", json!({ "n": 2 })).unwrap();
        bus.publish("p", "good", json!({})).unwrap();
        bus.publish("p", "good", json!({})).unwrap();

        wait_until(|| good_hits.load(Ordering::SeqCst) == 2).await;
        wait_until(|| sink.count(EventKind::CallbackFailed) == 2).await;
        assert_eq!(runtime.dispatch_count(), 2);

        runtime.teardown().await;
        assert_eq!(runtime.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_unregisters_from_bus() {
        let (bus, _) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .publish("out", MessageSchema::any(), QosProfile::default())
            .subscribe("in", MessageSchema::any(), QosProfile::default(), "on_in");
        let mut runtime = NodeRuntime::new("n", bus.clone(), decls, Duration::from_millis(20));
        let mut table = CallbackTable::new();
        table.register("on_in", |_| Ok(()));
        runtime.init_messages(&table, false).unwrap();
        runtime.start_dispatch();

        let ctx = runtime.context(Default::default());
        assert!(ctx.publish("out", json!({})));

        runtime.teardown().await;
        assert!(ctx.is_shutdown());
        assert!(!ctx.publish("out", json!({})));
        assert!(bus.registry().topics().is_empty());
    }

    #[test]
    fn test_second_subscription_on_topic_dropped_when_lenient() {
        let (bus, sink) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a")
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a_again");
        let mut runtime = NodeRuntime::new("n", bus.clone(), decls, Duration::from_millis(20));
        let mut table = CallbackTable::new();
        table.register("on_a", |_| Ok(()));
        table.register("on_a_again", |_| Ok(()));

        let report = runtime.init_messages(&table, false).unwrap();
        assert_eq!(report.subscribed, vec!["a".to_string()]);
        assert_eq!(report.dropped, vec![("a".to_string(), "on_a_again".to_string())]);
        assert_eq!(sink.count(EventKind::InitWarning), 1);
        assert_eq!(bus.registry().queues().len(), 1);
    }

    #[test]
    fn test_second_subscription_on_topic_fatal_when_strict() {
        let (bus, _) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a")
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a_again");
        let mut runtime = NodeRuntime::new("n", bus, decls, Duration::from_millis(20));
        let mut table = CallbackTable::new();
        table.register("on_a", |_| Ok(()));
        table.register("on_a_again", |_| Ok(()));

        let err = runtime.init_messages(&table, true).unwrap_err();
        assert!(matches!(err, BusError::DuplicateSubscription { ref existing, .. } if existing == "on_a"));
    }

    #[test]
    fn test_repeated_identical_subscription_binds_once() {
        let (bus, sink) = bus_with_sink();
        let decls = TopicDeclarations::new()
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a")
            .subscribe("a", MessageSchema::any(), QosProfile::default(), "on_a");
        let mut runtime = NodeRuntime::new("n", bus, decls, Duration::from_millis(20));
        let mut table = CallbackTable::new();
        table.register("on_a", |_| Ok(()));

        let report = runtime.init_messages(&table, true).unwrap();
        assert_eq!(report.subscribed, vec!["a".to_string()]);
        assert!(report.dropped.is_empty());
        assert_eq!(sink.count(EventKind::InitWarning), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_teardown_grace_is_shared_by_all_dispatch_tasks() {
        let (bus, _) = bus_with_sink();
        let topics: Vec<String> = (0..6).map(|i| format!("t{i}")).collect();
        let mut decls = TopicDeclarations::new();
        for topic in &topics {
            bus.declare_publisher("p", topic, QosProfile::default(), MessageSchema::any())
                .unwrap();
            decls = decls.subscribe(topic.as_str(), MessageSchema::any(), QosProfile::default(), "on_slow");
        }

        let started = Arc::new(AtomicUsize::new(0));
        let mut table = CallbackTable::new();
        {
            let started = started.clone();
            table.register("on_slow", move |_| {
                started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            });
        }

        let poll = Duration::from_millis(20);
        let mut runtime = NodeRuntime::new("n", bus.clone(), decls, poll);
        runtime.init_messages(&table, false).unwrap();
        runtime.start_dispatch();
        for topic in &topics {
            bus.publish("p", topic, json!({})).unwrap();
        }
        wait_until(|| started.load(Ordering::SeqCst) == topics.len()).await;

        let begun = std::time::Instant::now();
        runtime.teardown().await;
        assert!(begun.elapsed() < poll * 2 * topics.len() as u32);
        assert_eq!(runtime.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_context() {
        let (bus, _) = bus_with_sink();
        let parent = CancellationToken::new();
        let runtime = NodeRuntime::new("n", bus, TopicDeclarations::new(), Duration::from_millis(20))
            .with_parent(&parent);
        let ctx = runtime.context(Default::default());
        assert!(!ctx.is_shutdown());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), ctx.wait_for_shutdown())
            .await
            .expect("shutdown not observed");
    }
}
