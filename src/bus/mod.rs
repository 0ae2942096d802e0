//! Message bus facade - topic-based publish/subscribe with consumer groups.
//!
//! This module abstracts the broker: named topics divided into partitions
//! ("queues"), publish by key, pull-based consumption via consumer groups,
//! and a read-only view of each group's current queue assignments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MessageBus (facade)                      │
//! │  publish(topic, msg) / subscribe(group, topic)               │
//! │  assigned_queues(group)  <- read by the rebalance barrier    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                              │
//!          ▼                              ▼
//! ┌─────────────────┐          ┌─────────────────────────┐
//! │   InMemoryBus   │          │ Kafka / NATS / RabbitMQ │
//! │   (included)    │          │      (external)         │
//! └─────────────────┘          └─────────────────────────┘
//! ```
//!
//! The broker itself (durable storage, assignment protocol, networking) is
//! out of scope; anything that can express these three traits plugs in.

mod bus;
mod error;
mod in_memory;
mod message;

pub use bus::{MessageBus, QueueAssignments, QueueId, Subscription};
pub use error::PublishError;
pub use in_memory::InMemoryBus;
pub use message::{Message, CORRELATION_KEY};
