//! Identifiers shared by the order, truck and driver services.

mod types;

pub use types::{OrderId, ResourceId, ResourceKind};
