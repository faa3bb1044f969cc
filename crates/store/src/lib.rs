//! Per-service persistence for the dispatch saga.
//!
//! Each service owns its state exclusively: the order service keeps orders,
//! the truck and driver services keep their resource collections. Every
//! mutating operation commits the state change, a receipt for the message
//! that caused it, and the events it implies (the outbox) in one atomic
//! step.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod version;

pub use error::{Result, StoreError};
pub use memory::{InMemoryOrderStore, InMemoryResourceStore};
pub use postgres::{PostgresOrderStore, PostgresResourceStore, run_migrations};
pub use store::{
    ClaimOutcome, ClaimRender, Modification, OrderChange, OrderStore, OutboxEntry, OutboxStore,
    Purged, Release, ResourceStore, Scope,
};
pub use version::Version;
