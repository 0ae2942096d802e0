//! Wire-level message for the bus facade.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Metadata key carrying the correlation identifier of a command result.
pub const CORRELATION_KEY: &str = "correlation-id";

/// A message published to, or delivered from, a topic.
///
/// Commands, domain events, and command results all travel as `Message`s;
/// the `kind` tag tells consumers how to decode the payload, and the `key`
/// decides which partition (queue) of the topic the message lands on.
#[derive(Clone, Debug)]
pub struct Message {
    /// Unique identifier for this message (used for acknowledgment).
    pub id: String,
    /// Message type (e.g., "DepositMoney", "AccountCredited", "CommandResult").
    pub kind: String,
    /// Partition key. Messages with the same key land on the same queue,
    /// which is what preserves per-aggregate ordering.
    pub key: String,
    /// Serialized payload (bitcode or JSON).
    pub payload: Vec<u8>,
    /// Optional metadata (correlation IDs, headers).
    pub metadata: Option<Vec<(String, String)>>,
}

impl Message {
    /// Create a new message with the given kind, key, and raw payload.
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            key: key.into(),
            payload,
            metadata: None,
        }
    }

    /// Create a message with a bitcode-serialized payload.
    pub fn encode<T: Serialize>(
        id: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, bitcode::Error> {
        let bytes = bitcode::serialize(payload)?;
        Ok(Self::new(id, kind, key, bytes))
    }

    /// Decode the payload from bitcode binary format.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.payload)
    }

    /// Create a message with a JSON string payload.
    pub fn with_json_payload(
        id: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Self {
        Self::new(id, kind, key, payload.to_string().into_bytes())
    }

    /// Add a metadata pair to the message.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    /// Look up a metadata value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attach a correlation identifier (the originating command's id).
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_metadata(CORRELATION_KEY, id)
    }

    /// The correlation identifier, if this message carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata_value(CORRELATION_KEY)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
