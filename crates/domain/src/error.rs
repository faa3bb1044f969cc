//! Domain error types.

use thiserror::Error;

/// Errors raised while decoding or validating domain data.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A message arrived on a topic no service understands.
    #[error("Unknown event topic: {0}")]
    UnknownTopic(String),

    /// A payload did not match the schema of its topic.
    #[error("Malformed payload on topic '{topic}': {source}")]
    MalformedPayload {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A status entry carried a code outside the known set.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
