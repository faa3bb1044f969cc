use thiserror::Error;

/// Errors that can occur when talking to the event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker refused or could not accept a message.
    #[error("Publish failed on topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// A consumer group could not be subscribed.
    #[error("Subscribe failed for group '{group}': {reason}")]
    Subscribe { group: String, reason: String },

    /// The broker connection failed while receiving or committing.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The channel has been shut down.
    #[error("Event channel closed")]
    Closed,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
