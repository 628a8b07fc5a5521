//! # Fleet Types Crate
//!
//! Descriptors, QoS policies, schemas, messages, lifecycle states and the
//! error taxonomy shared by the message bus and the node supervisor.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a crate boundary lives here.
//! - **Immutable Declarations**: descriptors and topic declarations are read-only
//!   after load; only the Supervisor mutates lifecycle records.
//! - **Envelope Identity**: a message's `source` is set by the bus, never by the payload.

pub mod descriptor;
pub mod errors;
pub mod lifecycle;
pub mod message;
pub mod topic;

pub use descriptor::*;
pub use errors::*;
pub use lifecycle::*;
pub use message::*;
pub use topic::*;
