//! Event publisher with per-aggregate ordering enforcement.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bus::{Message, MessageBus, PublishError};

use super::types::{CommandResult, DomainEvent, RESULT_KIND};

/// Error type for event publishing.
#[derive(Debug)]
pub enum EventError {
    /// A sequence number at or below the last published for the aggregate.
    /// Nothing is published; the caller holds a stale or duplicate event.
    OrderingViolation {
        aggregate_id: String,
        last: u64,
        attempted: u64,
    },
    /// The event could not be serialized.
    Encode(String),
    /// The bus rejected the publish.
    Publish(PublishError),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::OrderingViolation {
                aggregate_id,
                last,
                attempted,
            } => write!(
                f,
                "ordering violation for aggregate {} (last sequence {}, attempted {})",
                aggregate_id, last, attempted
            ),
            EventError::Encode(msg) => write!(f, "event encoding failed: {}", msg),
            EventError::Publish(e) => write!(f, "publish failed: {}", e),
        }
    }
}

impl Error for EventError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EventError::Publish(e) => Some(e),
            _ => None,
        }
    }
}

/// Publishes domain events and command results to the event topic.
///
/// Events are keyed by aggregate id, so every event for one aggregate lands
/// on the same queue and arrives in publish order. The publisher tracks the
/// last sequence it accepted per aggregate and rejects regressions with
/// [`EventError::OrderingViolation`] before anything reaches the bus.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    last_sequence: Arc<Mutex<HashMap<String, u64>>>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            last_sequence: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The event topic this publisher writes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a domain event.
    ///
    /// The sequence must be strictly greater than the last accepted for the
    /// aggregate. The check and the publish happen under one lock, so two
    /// racing publishers cannot both claim the same sequence.
    pub fn publish(&self, event: &DomainEvent) -> Result<(), EventError> {
        let payload = bitcode::serialize(event).map_err(|e| EventError::Encode(e.to_string()))?;
        let message = Message::new(
            event.message_id(),
            event.kind.clone(),
            event.aggregate_id.clone(),
            payload,
        );

        let mut last_sequence = self.last_sequence.lock().unwrap();
        if let Some(&last) = last_sequence.get(&event.aggregate_id) {
            if event.sequence <= last {
                return Err(EventError::OrderingViolation {
                    aggregate_id: event.aggregate_id.clone(),
                    last,
                    attempted: event.sequence,
                });
            }
        }

        self.bus
            .publish(&self.topic, message)
            .map_err(EventError::Publish)?;
        last_sequence.insert(event.aggregate_id.clone(), event.sequence);

        debug!(
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            kind = %event.kind,
            "published domain event"
        );
        Ok(())
    }

    /// Publish a command result, tagged with the correlation identifier so
    /// the completed-command processor can match it to a pending command.
    pub fn publish_result(&self, result: &CommandResult) -> Result<(), EventError> {
        let payload = bitcode::serialize(result).map_err(|e| EventError::Encode(e.to_string()))?;
        let message = Message::new(
            format!("result#{}", result.correlation_id),
            RESULT_KIND,
            result.correlation_id.clone(),
            payload,
        )
        .with_correlation_id(result.correlation_id.clone());

        self.bus
            .publish(&self.topic, message)
            .map_err(EventError::Publish)
    }
}
