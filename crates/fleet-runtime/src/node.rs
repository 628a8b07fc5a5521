//! # Node Contract
//!
//! What a worker unit implements to be run by the supervisor, and what it is
//! handed in return.
//!
//! A node never sees the bus directly. It gets a [`NodeContext`] carrying a
//! [`BusHandle`] bound to its own name, so it can only publish as itself, and
//! it fills a [`CallbackTable`] during `init` that the runtime resolves its
//! subscriptions against.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_bus::{CallbackResolver, MessageBus, PublishReceipt};
use fleet_types::{BusError, Message, NodeDescriptor};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors raised by node code.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Initialisation failed: {0}")]
    Init(String),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Node failure: {0}")]
    Runtime(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Subscriber callback. Invoked synchronously by the node's dispatch task.
pub type Callback = Arc<dyn Fn(&Message) -> Result<(), NodeError> + Send + Sync>;

/// Future returned by a [`HealthProbe`].
pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// Externally supplied health check. `true` means healthy.
pub type HealthProbe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

/// Builds the node instance for a descriptor. Called once per descriptor.
pub type NodeFactory =
    Arc<dyn Fn(&NodeDescriptor) -> Result<Arc<dyn Node>, NodeError> + Send + Sync>;

/// Callback id to function, filled by the node during `init`.
#[derive(Clone, Default)]
pub struct CallbackTable {
    entries: HashMap<String, Callback>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `id`, replacing any previous entry.
    pub fn register<F>(&mut self, id: impl Into<String>, callback: F)
    where
        F: Fn(&Message) -> Result<(), NodeError> + Send + Sync + 'static,
    {
        self.entries.insert(id.into(), Arc::new(callback));
    }

    pub fn get(&self, id: &str) -> Option<Callback> {
        self.entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CallbackResolver for CallbackTable {
    fn has_callback(&self, callback_id: &str) -> bool {
        self.contains(callback_id)
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTable")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Publishing handle scoped to one node.
#[derive(Clone)]
pub struct BusHandle {
    node: String,
    bus: Arc<MessageBus>,
}

impl BusHandle {
    pub fn new(node: impl Into<String>, bus: Arc<MessageBus>) -> Self {
        Self {
            node: node.into(),
            bus,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Publish on `topic`. Returns `false` if the bus refused the message.
    pub fn publish(&self, topic: &str, payload: Value) -> bool {
        match self.try_publish(topic, payload) {
            Ok(_) => true,
            Err(e) => {
                warn!(node = %self.node, topic = %topic, error = %e, "Publish rejected");
                false
            }
        }
    }

    /// Publish on `topic`, returning the bus result.
    pub fn try_publish(&self, topic: &str, payload: Value) -> Result<PublishReceipt, BusError> {
        self.bus.publish(&self.node, topic, payload)
    }
}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHandle").field("node", &self.node).finish()
    }
}

/// Everything a node receives from the runtime.
#[derive(Debug, Clone)]
pub struct NodeContext {
    name: String,
    environment: BTreeMap<String, String>,
    bus: BusHandle,
    shutdown: CancellationToken,
}

impl NodeContext {
    pub fn new(
        name: impl Into<String>,
        environment: BTreeMap<String, String>,
        bus: BusHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            environment,
            bus,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Shorthand for `bus().publish(..)`.
    pub fn publish(&self, topic: &str, payload: Value) -> bool {
        self.bus.publish(topic, payload)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The node's shutdown token, cancelled when the runtime stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }
}

/// A long-lived worker unit.
///
/// `init` may be called again on the same instance after a restart.
#[async_trait]
pub trait Node: Send + Sync {
    /// Prepare state and register callbacks for the declared subscriptions.
    async fn init(&self, ctx: &NodeContext, callbacks: &mut CallbackTable)
        -> Result<(), NodeError>;

    /// Main loop. Returning an error counts as a crash.
    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        ctx.wait_for_shutdown().await;
        Ok(())
    }

    /// Release resources. Bounded by the node's shutdown timeout.
    async fn shutdown(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Health check used when no external probe is supplied.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Wrap a closure as a [`NodeFactory`].
pub fn factory<F>(f: F) -> NodeFactory
where
    F: Fn(&NodeDescriptor) -> Result<Arc<dyn Node>, NodeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as a [`HealthProbe`].
pub fn probe<F, Fut>(f: F) -> HealthProbe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as ProbeFuture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{MessageSchema, QosProfile};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_callback_table_resolves() {
        let mut table = CallbackTable::new();
        table.register("on_text", |_msg| Ok(()));
        assert!(table.has_callback("on_text"));
        assert!(!table.has_callback("on_audio"));
        assert_eq!(table.ids(), vec!["on_text".to_string()]);
    }

    #[test]
    fn test_bus_handle_publishes_as_owner() {
        let bus = Arc::new(MessageBus::default());
        bus.declare_publisher("sensor", "t", QosProfile::default(), MessageSchema::any())
            .unwrap();

        assert!(BusHandle::new("sensor", bus.clone()).publish("t", json!({})));
        assert!(!BusHandle::new("intruder", bus).publish("t", json!({})));
    }

    #[tokio::test]
    async fn test_context_shutdown_signal() {
        let token = CancellationToken::new();
        let ctx = NodeContext::new(
            "n",
            BTreeMap::from([("MODE".to_string(), "test".to_string())]),
            BusHandle::new("n", Arc::new(MessageBus::default())),
            token.child_token(),
        );
        assert_eq!(ctx.env("MODE"), Some("test"));
        assert!(!ctx.is_shutdown());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait_for_shutdown().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown not observed")
            .unwrap();
        assert!(ctx.is_shutdown());
    }

    #[tokio::test]
    async fn test_probe_wrapper() {
        let healthy = probe(|| async { true });
        assert!(healthy().await);
    }
}
