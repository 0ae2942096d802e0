//! Error type for bus operations.

use std::error::Error;
use std::fmt;

/// Error type for publish and subscribe operations.
#[derive(Debug)]
pub enum PublishError {
    /// Connection to the bus failed
    ConnectionFailed(String),
    /// Serialization of the message failed
    SerializationFailed(String),
    /// The bus rejected the message
    Rejected(String),
    /// Other error
    Other(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            PublishError::SerializationFailed(msg) => write!(f, "Serialization failed: {}", msg),
            PublishError::Rejected(msg) => write!(f, "Message rejected: {}", msg),
            PublishError::Other(e) => write!(f, "Publish error: {}", e),
        }
    }
}

impl Error for PublishError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PublishError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
