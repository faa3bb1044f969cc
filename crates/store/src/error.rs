use common::OrderId;
use domain::DomainError;
use thiserror::Error;

use crate::Version;

/// Errors that can occur when reading or writing a service's store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer updated the order between our read and our write.
    #[error(
        "Concurrency conflict for order {order_id}: expected version {expected}, found a newer one"
    )]
    ConcurrencyConflict { order_id: OrderId, expected: Version },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An outbound event could not be rendered.
    #[error("Event encoding error: {0}")]
    Encoding(#[from] DomainError),

    /// A stored value could not be mapped back into the domain.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Returns true if repeating the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Database(_)
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
