//! Command side: dispatch, pending-command correlation, and consumption.
//!
//! A caller hands a [`Command`] to the [`CommandService`], which registers a
//! pending entry and publishes the command to the command topic. Somewhere
//! else - possibly another process - a [`CommandConsumer`] picks it up,
//! runs the registered handler, and publishes a result event carrying the
//! command's id as correlation identifier. The completed-command processor
//! feeds that result back into the pending registry, which fulfills the
//! caller's [`CommandHandle`].

use std::error::Error;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bus::PublishError;

mod consumer;
mod dispatch;
mod pending;

pub use consumer::{CommandConsumer, CommandConsumerStats, CommandHandler};
pub use dispatch::{CommandService, SweepStats};
pub use pending::{CommandHandle, PendingCommands};

/// A command to be executed by a remote handler.
///
/// The id is caller-assigned and must be unique among commands still
/// pending; it doubles as the correlation identifier on the result event.
/// Immutable once sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    /// Type tag that selects the handler (e.g., "DepositMoney").
    pub kind: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl Command {
    /// Create a command with a raw payload.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Create a command with a bitcode-serialized payload.
    pub fn encode<T: Serialize>(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, bitcode::Error> {
        let bytes = bitcode::serialize(payload)?;
        Ok(Self::new(id, kind, bytes))
    }

    /// Decode the payload from bitcode binary format.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, bitcode::Error> {
        bitcode::deserialize(&self.payload)
    }

    /// Create a command with a JSON payload.
    pub fn with_json_payload(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Self {
        Self::new(id, kind, payload.to_string().into_bytes())
    }
}

/// Final outcome of a command, as seen by the caller.
///
/// `TimedOut` is resolved locally by the timeout sweep and is deliberately
/// distinct from `Failed`, which carries the remote handler's error detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

/// Error returned by [`CommandService::send`].
#[derive(Debug)]
pub enum SendError {
    /// The bus rejected the publish; the pending entry was rolled back.
    /// The caller must retry or abandon - there is no automatic retry.
    Publish(PublishError),
    /// The command could not be serialized.
    Encode(String),
    /// A command with this id is still pending.
    DuplicateId(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Publish(e) => write!(f, "publish failed: {}", e),
            SendError::Encode(msg) => write!(f, "command encoding failed: {}", msg),
            SendError::DuplicateId(id) => {
                write!(f, "a command with id {} is already pending", id)
            }
        }
    }
}

impl Error for SendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SendError::Publish(e) => Some(e),
            _ => None,
        }
    }
}
