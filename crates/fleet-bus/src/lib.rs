//! # Fleet Bus - In-Process Message Bus
//!
//! Every message between nodes goes through the bus. Nodes never call each
//! other directly.
//!
//! ## Contracts
//!
//! - A node publishes only on topics it declared as a publisher
//! - Payloads are validated against the topic schema fixed by the first publisher
//! - A subscription is bound only if the node resolves its callback id
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │    Node A    │                    │    Node B    │
//! │              │    publish()       │   dispatch   │
//! │              │ ──────┐            │      ↑       │
//! └──────────────┘       │            └──────┼───────┘
//!                        ▼                   │
//!                  ┌──────────────┐   ┌──────┴───────┐
//!                  │ Message Bus  │──▶│ SubscriberQ  │
//!                  └──────────────┘   └──────────────┘
//! ```
//!
//! ## Delivery
//!
//! Fan-out copies each message into every bound [`SubscriberQueue`].
//! `keep_last` queues evict their oldest entry, `keep_all` queues refuse the
//! newest one when full. Publishing never blocks.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod bus;
pub mod priority;
pub mod queue;
pub mod registry;

// Re-export main types
pub use bus::{BusStats, CallbackResolver, MessageBus, PublishReceipt};
pub use priority::{CancellationToken, Delivery, PriorityQueue};
pub use queue::{PushOutcome, QueueStats, SubscriberQueue};
pub use registry::{PublishContract, PublisherDeclared, SubscriberBound, TopicEntry, TopicRegistry};
