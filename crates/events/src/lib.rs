//! Messaging for the load-and-cache subsystem.
//!
//! - `bus`: transport-agnostic, partitioned pub/sub port
//! - `in_memory_bus`: in-process implementation for tests/dev
//! - `message`: dispatch requests and terminal-state notifications
//! - `topics`: per-type topic naming

pub mod bus;
pub mod in_memory_bus;
pub mod message;
pub mod topics;

pub use bus::{Ack, Delivery, Keyed, MessageBus, Subscription, partition_for};
pub use in_memory_bus::{DEFAULT_RETENTION, InMemoryBusError, InMemoryMessageBus};
pub use message::{DispatchMessage, LoadNotification};
pub use topics::LoadTopics;
