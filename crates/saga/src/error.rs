//! Saga error types.

use common::{OrderId, ResourceId, ResourceKind};
use domain::{ConflictCause, DomainError};
use event_channel::ChannelError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while running the saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A message arrived on a topic this service does not handle.
    #[error("Unknown event topic: {0}")]
    UnknownEventTopic(String),

    /// The resource an order asked for does not exist.
    #[error("{kind} {resource_id} not found")]
    ResourceNotFound {
        kind: ResourceKind,
        resource_id: ResourceId,
    },

    /// The resource an order asked for is held by another order.
    #[error("{kind} {resource_id} is already assigned to another order")]
    ResourceAlreadyAssigned {
        kind: ResourceKind,
        resource_id: ResourceId,
    },

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A client request was rejected before reaching the saga.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event channel error.
    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SagaError {
    /// Builds the diagnostic error for a rejected claim.
    pub fn rejection(kind: ResourceKind, resource_id: ResourceId, cause: ConflictCause) -> Self {
        match cause {
            ConflictCause::NotFound => SagaError::ResourceNotFound { kind, resource_id },
            ConflictCause::AlreadyAssigned => {
                SagaError::ResourceAlreadyAssigned { kind, resource_id }
            }
        }
    }

    /// Returns true if handling the message again may succeed.
    ///
    /// Retryable failures leave the delivery uncommitted so the broker hands
    /// it out again; everything else is a poison message.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Store(err) => err.is_transient(),
            SagaError::Channel(_) => true,
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
