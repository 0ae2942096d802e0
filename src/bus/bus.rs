//! Core traits for the message bus facade.

use std::collections::HashSet;

use super::error::PublishError;
use super::message::Message;

/// Identifier of a partition ("queue") within a topic.
pub type QueueId = u32;

/// Read-only view of consumer-group partition ownership.
///
/// The bus mutates assignments during rebalancing; everyone else - the
/// rebalance barrier in particular - only reads them through this trait.
pub trait QueueAssignments: Send + Sync {
    /// The set of queues the given consumer group currently owns.
    ///
    /// While a rebalance is in progress the returned set may be smaller
    /// than the topic's partition count.
    fn assigned_queues(&self, group: &str) -> HashSet<QueueId>;
}

/// A consumer-group member's handle onto its assigned queues.
///
/// This is a pull-based interface. Delivery is at-least-once: a message
/// that is polled but never acknowledged will be redelivered.
pub trait Subscription: Send {
    /// Poll for the next message from any assigned queue, blocking until
    /// one is available or the timeout expires.
    fn poll(&self, timeout_ms: u64) -> Result<Option<Message>, PublishError>;

    /// Acknowledge that a message has been processed.
    ///
    /// Acknowledging an unknown or already-acknowledged id is a no-op.
    fn ack(&self, message_id: &str) -> Result<(), PublishError>;
}

/// Trait for a topic-based publish/subscribe message bus.
///
/// Implementations might include:
/// - `InMemoryBus` - For testing and single-process scenarios (included)
/// - Kafka, NATS, or RabbitMQ adapters (external)
///
/// Two consumer groups subscribed to the same topic each receive every
/// message (fan-out); members within one group own disjoint queue sets
/// (competing consumers).
pub trait MessageBus: QueueAssignments {
    /// Publish a message to a topic. The message's `key` selects the queue.
    fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError>;

    /// Join a consumer group on a topic and return a subscription handle.
    ///
    /// Joining triggers a rebalance of the group's queue assignments.
    fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>, PublishError>;
}
