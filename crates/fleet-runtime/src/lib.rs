//! # Fleet Runtime Library
//!
//! Declarative node supervision on top of the fleet message bus.
//!
//! ## Layers
//!
//! - [`node`]: the `Node` trait, callback tables and the context a node receives
//! - [`runtime`]: per-node bus registration and callback dispatch
//! - [`graph`]: dependency resolution and launch order
//! - [`policy`]: restart backoff and health-failure accounting
//! - [`supervisor`]: lifecycle state machine driving every node
//! - [`demo`]: a sample three-node pipeline used by the binary

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod demo;
pub mod graph;
pub mod node;
pub mod policy;
pub mod runtime;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use graph::DependencyGraph;
pub use node::{
    factory, probe, BusHandle, Callback, CallbackTable, HealthProbe, Node, NodeContext, NodeError,
    NodeFactory,
};
pub use policy::{decide_restart, BackoffPolicy, HealthTracker, HealthVerdict, RestartDecision};
pub use runtime::{InitReport, NodeRuntime};
pub use supervisor::{NodeSpec, NodeStatus, NodeSupervisor};
