//! Choreographed delivery saga.
//!
//! Three autonomous services cooperate through the event channel only:
//! - the order service places orders and decides readiness or cancellation
//!   ([`OrderSagaController`]);
//! - the truck and driver services claim and release their resources
//!   ([`AssignmentManager`]).
//!
//! Every handler commits its state change, a receipt of the message and its
//! outbound events atomically, then flushes the outbox through an
//! [`OutboxRelay`]. A handler that fails with a retryable error leaves its
//! delivery uncommitted, so the channel redelivers it.

pub mod assignment;
pub mod cleanup;
pub mod consumer;
pub mod controller;
pub mod error;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod sweeper;

pub use assignment::AssignmentManager;
pub use cleanup::{CleanupConfig, OutboxCleanup};
pub use consumer::{Consumer, Handled};
pub use controller::OrderSagaController;
pub use error::{Result, SagaError};
pub use relay::{OutboxRelay, envelope};
pub use router::{EventHandler, EventRouter};
pub use runtime::{
    DRIVER_GROUP, Dispatch, ORDER_GROUP, RuntimeSettings, Service, Stores, TRUCK_GROUP,
};
pub use sweeper::TimeoutSweeper;
