//! Order aggregate and its status history.

mod aggregate;
mod state;

pub use aggregate::{
    AWAITING_CONFIRMATION, CONFIRMATION_TIMED_OUT, Fulfillment, IN_FULFILLMENT, Order,
};
pub use state::{StatusCode, StatusEntry};
