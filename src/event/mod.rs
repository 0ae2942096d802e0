//! Event side: ordered publishing and consumption of domain events.
//!
//! The event topic carries two things: domain events produced by command
//! handlers, and the [`CommandResult`] events that close the correlation
//! loop. Ordering is enforced at both ends - the publisher rejects sequence
//! regressions per aggregate, and the sequential consumer skips stale
//! redeliveries - under the assumption that the aggregate id is the
//! partition key, so one aggregate's events always share a queue.

mod consumer;
mod publisher;
mod types;

pub use consumer::{EventConsumer, EventConsumerStats, EventHandler};
pub use publisher::{EventError, EventPublisher};
pub use types::{CommandResult, DomainEvent, RESULT_KIND};
