//! Domain layer for the order, truck and driver services.
//!
//! This crate provides the contracts the three services share:
//! - the order aggregate with its append-only status history
//! - the resource entity owned by the truck and driver services
//! - the saga events, one variant per broker topic

pub mod error;
pub mod events;
pub mod order;
pub mod resource;

pub use error::DomainError;
pub use events::{
    AssignedData, CancellationNotice, ConflictCause, ConflictedData, DEAD_LETTER_TOPIC,
    SagaEvent, Topic,
};
pub use order::{
    AWAITING_CONFIRMATION, CONFIRMATION_TIMED_OUT, Fulfillment, IN_FULFILLMENT, Order, StatusCode,
    StatusEntry,
};
pub use resource::Resource;
