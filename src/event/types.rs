//! Typed payloads carried on the event topic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::CommandOutcome;

/// Message kind used for command result events on the event topic.
pub const RESULT_KIND: &str = "CommandResult";

/// A domain event produced by a command handler.
///
/// Sequence numbers are monotonic per aggregate; the publisher rejects
/// regressions, and consumers rely on the aggregate id doubling as the
/// partition key so one aggregate's events always share a queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainEvent {
    pub aggregate_id: String,
    pub sequence: u64,
    /// Event type (e.g., "AccountCredited").
    pub kind: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl DomainEvent {
    /// Create an event with a raw payload.
    pub fn new(
        aggregate_id: impl Into<String>,
        sequence: u64,
        kind: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            sequence,
            kind: kind.into(),
            payload,
        }
    }

    /// Create an event with a bitcode-serialized payload.
    pub fn encode<T: Serialize>(
        aggregate_id: impl Into<String>,
        sequence: u64,
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, bitcode::Error> {
        let bytes = bitcode::serialize(payload)?;
        Ok(Self::new(aggregate_id, sequence, kind, bytes))
    }

    /// Decode the payload from bitcode binary format.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.payload)
    }

    /// Wire message id: unique per (aggregate, sequence).
    pub fn message_id(&self) -> String {
        format!("{}#{}", self.aggregate_id, self.sequence)
    }
}

/// The outcome of a command's execution, published as an event so that the
/// process holding the pending registry can correlate it back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    /// The originating command's id.
    pub correlation_id: String,
    pub success: bool,
    /// Handler error detail when `success` is false.
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }

    /// The caller-facing outcome this result maps to.
    ///
    /// Never yields `TimedOut` - timeouts are resolved locally by the
    /// sweep, not by result events.
    pub fn outcome(&self) -> CommandOutcome {
        if self.success {
            CommandOutcome::Succeeded
        } else {
            CommandOutcome::Failed(self.error.clone().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_maps_to_outcome() {
        assert_eq!(
            CommandResult::success("cmd-1").outcome(),
            CommandOutcome::Succeeded
        );
        assert_eq!(
            CommandResult::failure("cmd-1", "insufficient funds").outcome(),
            CommandOutcome::Failed("insufficient funds".into())
        );
    }

    #[test]
    fn message_id_is_unique_per_sequence() {
        let first = DomainEvent::new("acct-1", 1, "AccountCredited", Vec::new());
        let second = DomainEvent::new("acct-1", 2, "AccountCredited", Vec::new());
        assert_ne!(first.message_id(), second.message_id());
    }
}
