//! # Node Supervisor
//!
//! Owns every node's lifecycle record and drives the state machine.
//!
//! ```text
//!                       ┌──────────────── NodeSupervisor ────────────────┐
//!   admit() ──────────→ │ specs ── records ── DependencyGraph ── order   │
//!   apply_overrides()   │                                                │
//!   launch_all() ─────→ │   actor(A)      actor(B)      actor(C)         │
//!                       │     │ init        │ init        │ init         │
//!                       │     │ dispatch    │ dispatch    │ dispatch     │
//!                       │     │ probe       │ probe       │ probe        │
//!                       └─────┼─────────────┼─────────────┼──────────────┘
//!                             └──────── MessageBus ───────┘
//! ```
//!
//! ## Actors
//!
//! Each launched node gets one actor task. The actor gates on its required
//! dependencies being `Healthy`, runs `init` and `init_messages` under
//! `startup_timeout`, spawns the node's main loop, and then probes health on
//! the node's interval. A crash (init error, main loop error or panic, or
//! `failure_threshold` consecutive probe failures) tears the runtime down and
//! consults the restart policy.
//!
//! Only actors write lifecycle records, and every write goes through
//! [`Inner::transition`], which rejects edges the state machine does not allow.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_bus::MessageBus;
use fleet_telemetry::{
    DynEventSink, EventKind, TracingSink, HEALTH_CHECK_FAILURES, NODE_LIFECYCLE_STATE,
    NODE_RESTARTS,
};
use fleet_types::{
    ConfigError, FleetError, LifecycleError, LifecycleRecord, NodeDescriptor, NodeLifecycleState,
    NodeOverrides, RestartPolicy, TopicDeclarations,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::graph::DependencyGraph;
use crate::node::{CallbackTable, HealthProbe, Node, NodeError, NodeFactory, ProbeFuture};
use crate::policy::{decide_restart, BackoffPolicy, HealthTracker, HealthVerdict, RestartDecision};
use crate::runtime::{panic_message, NodeRuntime};

use NodeLifecycleState::*;

/// Everything needed to run one node.
#[derive(Clone)]
pub struct NodeSpec {
    pub descriptor: NodeDescriptor,
    pub declarations: TopicDeclarations,
    pub factory: NodeFactory,
    /// Replaces `Node::health_check` when set.
    pub probe: Option<HealthProbe>,
}

impl NodeSpec {
    pub fn new(
        descriptor: NodeDescriptor,
        declarations: TopicDeclarations,
        factory: NodeFactory,
    ) -> Self {
        Self {
            descriptor,
            declarations,
            factory,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("descriptor", &self.descriptor)
            .field("declarations", &self.declarations)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub state: NodeLifecycleState,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_transition: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl NodeStatus {
    fn from_record(name: &str, record: &LifecycleRecord) -> Self {
        Self {
            name: name.to_string(),
            state: record.state,
            restart_count: record.restart_count,
            consecutive_failures: record.consecutive_failures,
            last_health_check: record.last_health_check,
            last_transition: record.last_transition,
            last_error: record.last_error.clone(),
        }
    }
}

struct ActorHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: SupervisorConfig,
    bus: Arc<MessageBus>,
    sink: DynEventSink,
    specs: RwLock<BTreeMap<String, NodeSpec>>,
    records: RwLock<BTreeMap<String, LifecycleRecord>>,
    actors: Mutex<BTreeMap<String, ActorHandle>>,
    order: RwLock<Vec<String>>,
    launched: AtomicBool,
    overrides_applied: AtomicBool,
    /// Parent of every actor's stop token.
    root: CancellationToken,
    /// Bumped on every state change.
    changes: watch::Sender<u64>,
}

impl Inner {
    fn state(&self, name: &str) -> Option<NodeLifecycleState> {
        self.records.read().get(name).map(|r| r.state)
    }

    /// The single write path for lifecycle states.
    fn transition(
        &self,
        name: &str,
        next: NodeLifecycleState,
        error: Option<String>,
    ) -> Result<NodeLifecycleState, LifecycleError> {
        let result = {
            let mut records = self.records.write();
            match records.get_mut(name) {
                Some(record) => {
                    let result = record.transition(next);
                    if result.is_ok() {
                        if let Some(error) = error {
                            record.last_error = Some(error);
                        }
                    }
                    result
                }
                None => {
                    return Err(LifecycleError::InvalidTransition {
                        node: name.to_string(),
                        from: "untracked".to_string(),
                        to: next.to_string(),
                    })
                }
            }
        };

        match result {
            Ok(previous) => {
                NODE_LIFECYCLE_STATE
                    .with_label_values(&[name])
                    .set(next.as_code());
                self.sink.record_event(
                    EventKind::StateTransition,
                    name,
                    &format!("{previous} -> {next}"),
                );
                self.changes.send_modify(|generation| *generation += 1);
                Ok(previous)
            }
            Err(current) => {
                warn!(node = %name, from = %current, to = %next, "[Supervisor] Illegal transition rejected");
                Err(LifecycleError::InvalidTransition {
                    node: name.to_string(),
                    from: current.to_string(),
                    to: next.to_string(),
                })
            }
        }
    }

    /// [`Self::transition`] where a rejected edge needs no handling beyond
    /// the warning it already logs.
    fn advance(&self, name: &str, next: NodeLifecycleState, error: Option<String>) {
        let _ = self.transition(name, next, error);
    }

    fn update_record(&self, name: &str, update: impl FnOnce(&mut LifecycleRecord)) {
        if let Some(record) = self.records.write().get_mut(name) {
            update(record);
        }
    }

    /// Drive a node that did not stop on its own into `Stopped`.
    fn force_stopped(&self, name: &str) {
        let Some(state) = self.state(name) else {
            return;
        };
        if state.is_terminal() {
            return;
        }
        if !state.can_transition_to(Stopped) {
            self.advance(name, Stopping, None);
        }
        self.advance(name, Stopped, None);
    }

    /// Wait until `done` holds for `name`, or `limit` passes.
    async fn wait_for_state(
        &self,
        name: &str,
        limit: Duration,
        done: impl Fn(NodeLifecycleState) -> bool,
    ) -> bool {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                changes.borrow_and_update();
                if self.state(name).map_or(true, &done) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

/// Runs the fleet.
///
/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct NodeSupervisor {
    inner: Arc<Inner>,
}

impl NodeSupervisor {
    /// Supervisor reporting through `tracing`.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Supervisor reporting through `sink`.
    pub fn with_sink(config: SupervisorConfig, sink: DynEventSink) -> Self {
        let bus = MessageBus::new(sink.clone())
            .with_self_delivery_suppressed(config.suppress_self_delivery);
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                bus: Arc::new(bus),
                sink,
                specs: RwLock::new(BTreeMap::new()),
                records: RwLock::new(BTreeMap::new()),
                actors: Mutex::new(BTreeMap::new()),
                order: RwLock::new(Vec::new()),
                launched: AtomicBool::new(false),
                overrides_applied: AtomicBool::new(false),
                root: CancellationToken::new(),
                changes,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Register a node. Disabled descriptors are kept aside and get no
    /// lifecycle record unless an override enables them.
    pub fn admit(&self, spec: NodeSpec) -> Result<(), ConfigError> {
        if self.inner.launched.load(Ordering::SeqCst) {
            return Err(ConfigError::InvalidRuntime(format!(
                "cannot admit '{}' after launch",
                spec.name()
            )));
        }
        spec.descriptor.validate()?;

        let name = spec.name().to_string();
        let enabled = spec.descriptor.enabled;
        {
            let mut specs = self.inner.specs.write();
            if specs.contains_key(&name) {
                return Err(ConfigError::DuplicateNode(name));
            }
            specs.insert(name.clone(), spec);
        }

        if enabled {
            self.inner
                .records
                .write()
                .insert(name.clone(), LifecycleRecord::new());
            NODE_LIFECYCLE_STATE
                .with_label_values(&[name.as_str()])
                .set(Pending.as_code());
            info!(node = %name, "[Supervisor] Admitted node");
        } else {
            info!(node = %name, "[Supervisor] Skipping disabled node");
        }
        Ok(())
    }

    /// Merge operator overrides. Allowed once, before launch.
    pub fn apply_overrides(
        &self,
        overrides: &BTreeMap<String, NodeOverrides>,
    ) -> Result<(), ConfigError> {
        let result = self.merge_overrides(overrides);
        if let Err(e) = &result {
            self.inner
                .sink
                .record_event(EventKind::ConfigRejected, "supervisor", &e.to_string());
        }
        result
    }

    fn merge_overrides(&self, overrides: &BTreeMap<String, NodeOverrides>) -> Result<(), ConfigError> {
        if self.inner.launched.load(Ordering::SeqCst)
            || self.inner.overrides_applied.load(Ordering::SeqCst)
        {
            return Err(ConfigError::OverridesAfterLaunch);
        }

        let mut specs = self.inner.specs.write();
        let mut merged = Vec::with_capacity(overrides.len());
        for (name, layer) in overrides {
            let spec = specs
                .get(name)
                .ok_or_else(|| ConfigError::UnknownNode(name.clone()))?;
            let mut descriptor = spec.descriptor.clone();
            descriptor.merge_overrides(layer);
            descriptor.validate()?;
            merged.push((name.clone(), descriptor));
        }

        let mut records = self.inner.records.write();
        for (name, descriptor) in merged {
            if descriptor.enabled {
                records.entry(name.clone()).or_insert_with(LifecycleRecord::new);
            } else {
                records.remove(&name);
            }
            if let Some(spec) = specs.get_mut(&name) {
                spec.descriptor = descriptor;
            }
            debug!(node = %name, "[Supervisor] Overrides merged");
        }
        self.inner.overrides_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resolve the graph and start every enabled node in dependency order.
    ///
    /// A configuration error aborts before any node leaves `Pending`.
    /// Individual node failures are reported through [`Self::status`].
    pub async fn launch_all(&self) -> Result<(), FleetError> {
        if self.inner.launched.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::InvalidRuntime("fleet already launched".to_string()).into());
        }

        let specs: BTreeMap<String, NodeSpec> = self
            .inner
            .specs
            .read()
            .iter()
            .filter(|(_, spec)| spec.descriptor.enabled)
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();

        let planned = DependencyGraph::build(specs.values().map(|s| &s.descriptor))
            .and_then(|graph| graph.topological_order().map(|order| (graph, order)));
        let (graph, order) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                error!(error = %e, "[Supervisor] Fleet configuration rejected");
                self.inner
                    .sink
                    .record_event(EventKind::ConfigRejected, "supervisor", &e.to_string());
                return Err(e.into());
            }
        };
        *self.inner.order.write() = order.clone();
        info!(order = ?order, parallel = self.inner.config.parallel_launch, "[Supervisor] Launching fleet");

        for name in &order {
            let Some(spec) = specs.get(name) else {
                continue;
            };
            let node = match (spec.factory)(&spec.descriptor) {
                Ok(node) => node,
                Err(e) => {
                    let reason = LifecycleError::InitFailed {
                        node: name.clone(),
                        reason: e.to_string(),
                    };
                    error!(node = %name, error = %reason, "[Supervisor] Node construction failed");
                    self.inner.advance(name, Failed, Some(reason.to_string()));
                    continue;
                }
            };

            let stop = self.inner.root.child_token();
            let actor = NodeActor {
                inner: Arc::clone(&self.inner),
                name: name.clone(),
                spec: spec.clone(),
                node,
                dependencies: graph.dependencies_of(name),
                stop: stop.clone(),
            };
            let task = tokio::spawn(actor.run());
            self.inner
                .actors
                .lock()
                .insert(name.clone(), ActorHandle { stop, task });

            if !self.inner.config.parallel_launch {
                let settled = self
                    .inner
                    .wait_for_state(name, self.inner.config.ready_timeout, |s| {
                        s == Healthy || s.is_terminal()
                    })
                    .await;
                if !settled {
                    warn!(node = %name, "[Supervisor] Node not healthy within ready timeout, continuing");
                }
            }
        }
        Ok(())
    }

    /// Wait until every enabled node is `Healthy`.
    ///
    /// Fails with `ReadinessTimeout` after `ready_timeout`, or as soon as a
    /// node reaches a terminal state.
    pub async fn wait_for_healthy(&self) -> Result<(), LifecycleError> {
        let mut changes = self.inner.changes.subscribe();
        let deadline = tokio::time::Instant::now() + self.inner.config.ready_timeout;

        loop {
            changes.borrow_and_update();
            let (pending, settled_badly) = {
                let records = self.inner.records.read();
                let pending: Vec<String> = records
                    .iter()
                    .filter(|(_, r)| r.state != Healthy)
                    .map(|(name, _)| name.clone())
                    .collect();
                let terminal = records.values().any(|r| r.state.is_terminal());
                (pending, terminal)
            };
            if pending.is_empty() {
                info!("[Supervisor] Fleet healthy");
                return Ok(());
            }
            if settled_badly {
                return Err(self.readiness_failed(pending));
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Err(self.readiness_failed(pending)),
            }
        }
    }

    fn readiness_failed(&self, pending: Vec<String>) -> LifecycleError {
        let err = LifecycleError::ReadinessTimeout { pending };
        self.inner
            .sink
            .record_event(EventKind::ReadinessTimeout, "supervisor", &err.to_string());
        err
    }

    /// Stop every node in reverse launch order and wait for each.
    pub async fn shutdown(&self) {
        let mut order = self.inner.order.read().clone();
        if order.is_empty() {
            order = self.inner.records.read().keys().cloned().collect();
        }
        info!(nodes = order.len(), "[Supervisor] Shutting down fleet");

        for name in order.iter().rev() {
            let handle = self.inner.actors.lock().remove(name);
            let Some(mut handle) = handle else {
                self.inner.force_stopped(name);
                continue;
            };
            handle.stop.cancel();

            let grace = self
                .inner
                .specs
                .read()
                .get(name)
                .map(|s| s.descriptor.shutdown_timeout)
                .unwrap_or_default()
                + self.inner.config.dispatch_poll_interval * 4
                + Duration::from_millis(500);

            if tokio::time::timeout(grace, &mut handle.task).await.is_err() {
                warn!(node = %name, "[Supervisor] Actor did not finish, aborting");
                handle.task.abort();
                self.inner.bus.unregister_node(name);
                self.inner.sink.record_event(
                    EventKind::ShutdownForced,
                    name,
                    &format!("actor aborted after {grace:?}"),
                );
            }
            self.inner.force_stopped(name);
        }
        self.inner.root.cancel();

        let stats = self.inner.bus.stats();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            rejected = stats.rejected,
            "[Supervisor] Fleet stopped"
        );
    }

    /// Current status of `name`, if it has a lifecycle record.
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.inner
            .records
            .read()
            .get(name)
            .map(|r| NodeStatus::from_record(name, r))
    }

    pub fn state(&self, name: &str) -> Option<NodeLifecycleState> {
        self.inner.state(name)
    }

    /// Status of every node with a lifecycle record, by name.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.inner
            .records
            .read()
            .iter()
            .map(|(name, r)| NodeStatus::from_record(name, r))
            .collect()
    }

    /// Nodes in `Failed`, with their last error.
    pub fn failed_nodes(&self) -> Vec<(String, Option<String>)> {
        self.inner
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.state == Failed)
            .map(|(name, r)| (name.clone(), r.last_error.clone()))
            .collect()
    }

    /// Launch order, empty before `launch_all`.
    pub fn launch_order(&self) -> Vec<String> {
        self.inner.order.read().clone()
    }

    /// Wait until `name` reaches `state`, bounded by `limit`.
    pub async fn wait_for(&self, name: &str, state: NodeLifecycleState, limit: Duration) -> bool {
        self.inner.wait_for_state(name, limit, |s| s == state).await
    }
}

impl fmt::Debug for NodeSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSupervisor")
            .field("config", &self.inner.config)
            .field("nodes", &self.inner.records.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// PER-NODE ACTOR
// =============================================================================

enum Attempt {
    /// Shut down on request or clean exit; record is `Stopped`.
    Stopped,
    /// Unrecoverable; goes straight to `Failed`.
    Fatal(String),
    /// Counts against the restart policy.
    Crashed(String),
}

enum Monitor {
    Stop,
    Exited(Result<Result<(), NodeError>, tokio::task::JoinError>),
    Probe,
}

struct NodeActor {
    inner: Arc<Inner>,
    name: String,
    spec: NodeSpec,
    node: Arc<dyn Node>,
    dependencies: Vec<String>,
    /// Child of the supervisor's root token; cancelled to stop this node.
    stop: CancellationToken,
}

impl NodeActor {
    fn advance(&self, next: NodeLifecycleState, error: Option<String>) {
        self.inner.advance(&self.name, next, error);
    }

    async fn run(self) {
        if !self.await_dependencies().await {
            return;
        }

        let desc = self.spec.descriptor.clone();
        let backoff = BackoffPolicy::new(
            desc.restart_delay,
            self.inner.config.backoff_factor,
            self.inner.config.max_restart_delay,
        );

        loop {
            if self.stop.is_cancelled() {
                self.advance(Stopped, None);
                return;
            }
            if self.inner.transition(&self.name, Starting, None).is_err() {
                return;
            }

            let reason = match self.attempt().await {
                Attempt::Stopped => return,
                Attempt::Fatal(reason) => {
                    error!(node = %self.name, error = %reason, "[Supervisor] Node failed");
                    self.advance(Failed, Some(reason));
                    return;
                }
                Attempt::Crashed(reason) => reason,
            };

            warn!(node = %self.name, error = %reason, "[Supervisor] Node crashed");
            self.advance(Unhealthy, Some(reason.clone()));

            let restarts = self
                .inner
                .records
                .read()
                .get(&self.name)
                .map_or(0, |r| r.restart_count);

            match decide_restart(desc.restart_policy, restarts, desc.max_restarts, &backoff) {
                RestartDecision::GiveUp { restarts } => {
                    let error = if desc.restart_policy == RestartPolicy::OnFailure {
                        LifecycleError::RestartBudgetExhausted {
                            node: self.name.clone(),
                            restarts,
                        }
                        .to_string()
                    } else {
                        reason
                    };
                    error!(node = %self.name, policy = ?desc.restart_policy, error = %error, "[Supervisor] Not restarting");
                    self.advance(Failed, Some(error));
                    return;
                }
                RestartDecision::Restart {
                    attempt,
                    delay,
                    over_budget,
                } => {
                    self.advance(Restarting, None);
                    self.inner
                        .update_record(&self.name, |r| r.restart_count = attempt);
                    NODE_RESTARTS
                        .with_label_values(&[self.name.as_str()])
                        .inc();
                    self.inner.sink.record_event(
                        EventKind::Restart,
                        &self.name,
                        &format!("attempt {attempt} in {delay:?}"),
                    );
                    if over_budget {
                        warn!(
                            node = %self.name,
                            attempt,
                            max_restarts = desc.max_restarts,
                            "[Supervisor] Restart budget exceeded, restarting anyway"
                        );
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.cancelled() => {
                            self.advance(Stopped, None);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Block until every required dependency is `Healthy`.
    ///
    /// Returns `false` after moving the node to a terminal state.
    async fn await_dependencies(&self) -> bool {
        if self.dependencies.is_empty() {
            return true;
        }
        let mut changes = self.inner.changes.subscribe();
        loop {
            changes.borrow_and_update();

            let mut all_healthy = true;
            for dep in &self.dependencies {
                match self.inner.state(dep) {
                    Some(Healthy) => {}
                    Some(state) if state.is_terminal() => {
                        let err = LifecycleError::DependencyFailed {
                            node: self.name.clone(),
                            dependency: dep.clone(),
                        };
                        error!(node = %self.name, dependency = %dep, "[Supervisor] Dependency unavailable");
                        self.advance(Failed, Some(err.to_string()));
                        return false;
                    }
                    _ => all_healthy = false,
                }
            }
            if all_healthy {
                return true;
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.stop.cancelled() => {
                    self.advance(Stopped, None);
                    return false;
                }
            }
        }
    }

    /// One launch: init, run, monitor. The record is `Starting` on entry.
    async fn attempt(&self) -> Attempt {
        let desc = &self.spec.descriptor;
        let config = &self.inner.config;
        self.inner
            .update_record(&self.name, |r| r.consecutive_failures = 0);

        let mut runtime = NodeRuntime::new(
            self.name.clone(),
            Arc::clone(&self.inner.bus),
            self.spec.declarations.clone(),
            config.dispatch_poll_interval,
        )
        .with_parent(&self.stop);
        let ctx = runtime.context(desc.environment.clone());
        let node = Arc::clone(&self.node);
        let strict = config.strict_callbacks;

        let init = {
            let runtime = &mut runtime;
            let ctx = &ctx;
            async move {
                let mut callbacks = CallbackTable::new();
                if let Err(e) = node.init(ctx, &mut callbacks).await {
                    return Err(e.to_string());
                }
                runtime
                    .init_messages(&callbacks, strict)
                    .map_err(|e| e.to_string())
            }
        };
        let init = tokio::select! {
            result = tokio::time::timeout(desc.startup_timeout, init) => Some(result),
            _ = self.stop.cancelled() => None,
        };

        match init {
            None => {
                self.advance(Stopping, None);
                runtime.teardown().await;
                self.advance(Stopped, None);
                return Attempt::Stopped;
            }
            Some(Err(_)) => {
                runtime.teardown().await;
                return Attempt::Fatal(
                    LifecycleError::StartupTimeout {
                        node: self.name.clone(),
                        timeout: desc.startup_timeout,
                    }
                    .to_string(),
                );
            }
            Some(Ok(Err(reason))) => {
                runtime.teardown().await;
                return Attempt::Crashed(
                    LifecycleError::InitFailed {
                        node: self.name.clone(),
                        reason,
                    }
                    .to_string(),
                );
            }
            Some(Ok(Ok(report))) => {
                debug!(
                    node = %self.name,
                    published = ?report.published,
                    subscribed = ?report.subscribed,
                    "[Supervisor] Node initialised"
                );
            }
        }

        runtime.start_dispatch();
        let mut main = MainLoop::spawn(Arc::clone(&self.node), ctx.clone(), desc.isolated);
        self.advance(Running, None);

        let health = desc.health_check.clone();
        if !health.enabled {
            self.advance(Healthy, None);
        }
        let mut tracker = HealthTracker::new(health.failure_threshold);
        let mut ticker = tokio::time::interval(health.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Monitor::Stop,
                joined = &mut main.task => Monitor::Exited(joined),
                _ = ticker.tick(), if health.enabled => Monitor::Probe,
            };

            match event {
                Monitor::Stop => return self.stop_node(runtime, main).await,
                Monitor::Exited(Ok(Ok(()))) => {
                    info!(node = %self.name, "[Supervisor] Main loop exited cleanly");
                    self.advance(Stopping, None);
                    runtime.teardown().await;
                    self.advance(Stopped, None);
                    return Attempt::Stopped;
                }
                Monitor::Exited(Ok(Err(e))) => {
                    runtime.teardown().await;
                    return Attempt::Crashed(e.to_string());
                }
                Monitor::Exited(Err(join)) => {
                    runtime.teardown().await;
                    let reason = if join.is_panic() {
                        format!("main loop panicked: {}", panic_message(join.into_panic().as_ref()))
                    } else {
                        "main loop cancelled".to_string()
                    };
                    return Attempt::Crashed(reason);
                }
                Monitor::Probe => {
                    let healthy = self.probe(health.timeout).await;
                    let verdict = tracker.record(healthy);
                    let consecutive = tracker.consecutive();
                    self.inner.update_record(&self.name, |r| {
                        r.last_health_check = Some(Utc::now());
                        r.consecutive_failures = consecutive;
                    });

                    match verdict {
                        HealthVerdict::Passed => {
                            if self.inner.state(&self.name) == Some(Running) {
                                self.advance(Healthy, None);
                            }
                        }
                        HealthVerdict::Degraded { consecutive } => {
                            self.report_probe_failure(consecutive, health.failure_threshold);
                        }
                        HealthVerdict::Unhealthy { consecutive } => {
                            self.report_probe_failure(consecutive, health.failure_threshold);
                            self.terminate(&mut main).await;
                            runtime.teardown().await;
                            return Attempt::Crashed(format!(
                                "health check failed {consecutive} consecutive times"
                            ));
                        }
                    }
                }
            }
        }
    }

    fn report_probe_failure(&self, consecutive: u32, threshold: u32) {
        HEALTH_CHECK_FAILURES
            .with_label_values(&[self.name.as_str()])
            .inc();
        self.inner.sink.record_event(
            EventKind::HealthCheckFailed,
            &self.name,
            &format!("{consecutive}/{threshold} consecutive failures"),
        );
    }

    async fn probe(&self, limit: Duration) -> bool {
        let check: ProbeFuture = match &self.spec.probe {
            Some(probe) => probe(),
            None => {
                let node = Arc::clone(&self.node);
                Box::pin(async move { node.health_check().await })
            }
        };
        tokio::time::timeout(limit, check).await.unwrap_or(false)
    }

    /// Forcibly end the main loop, then give it one poll interval to unwind.
    async fn terminate(&self, main: &mut MainLoop) {
        main.terminate();
        let unwind = self.inner.config.dispatch_poll_interval;
        if tokio::time::timeout(unwind, &mut main.task).await.is_err() {
            warn!(node = %self.name, "[Supervisor] Main loop still unwinding after termination");
        }
    }

    async fn stop_node(&self, mut runtime: NodeRuntime, mut main: MainLoop) -> Attempt {
        let limit = self.spec.descriptor.shutdown_timeout;
        self.advance(Stopping, None);
        runtime.signal_shutdown();

        let node = Arc::clone(&self.node);
        let name = self.name.clone();
        let graceful = async {
            if let Err(e) = node.shutdown().await {
                warn!(node = %name, error = %e, "[Supervisor] Node shutdown hook failed");
            }
            let _ = (&mut main.task).await;
        };
        if tokio::time::timeout(limit, graceful).await.is_err() {
            self.terminate(&mut main).await;
            let err = LifecycleError::ShutdownTimeout {
                node: self.name.clone(),
                timeout: limit,
            };
            self.inner
                .sink
                .record_event(EventKind::ShutdownForced, &self.name, &err.to_string());
        }

        runtime.teardown().await;
        self.advance(Stopped, None);
        Attempt::Stopped
    }
}

/// A node's spawned main loop.
///
/// `kill` is raced against `Node::run` inside the task itself, so termination
/// also reaches an isolated node whose loop runs on its own blocking thread,
/// where `JoinHandle::abort` has no effect.
struct MainLoop {
    task: JoinHandle<Result<(), NodeError>>,
    kill: CancellationToken,
}

impl MainLoop {
    fn spawn(node: Arc<dyn Node>, ctx: crate::node::NodeContext, isolated: bool) -> Self {
        let kill = CancellationToken::new();
        let guarded = {
            let kill = kill.clone();
            async move {
                tokio::select! {
                    result = node.run(ctx) => result,
                    _ = kill.cancelled() => Err(NodeError::Runtime("main loop terminated".to_string())),
                }
            }
        };
        let task = if isolated {
            // Dedicated blocking thread.
            let handle = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || handle.block_on(guarded))
        } else {
            tokio::spawn(guarded)
        };
        Self { task, kill }
    }

    fn terminate(&self) {
        self.kill.cancel();
        self.task.abort();
    }
}
