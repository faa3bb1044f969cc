//! Order aggregate implementation.

use chrono::{DateTime, Duration, Utc};
use common::{OrderId, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};

use super::{StatusCode, StatusEntry};

/// Status name recorded when an order is first placed.
pub const AWAITING_CONFIRMATION: &str = "awaiting confirmation";
/// Status name recorded once both resources are secured.
pub const IN_FULFILLMENT: &str = "in fulfillment";
/// Conflict reason recorded when an order waits too long for its resources.
pub const CONFIRMATION_TIMED_OUT: &str = "confirmation timed out";

/// Which resources an order asked for and which of them are confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfillment {
    pub is_truck_assigned: bool,
    pub is_driver_assigned: bool,
    pub truck_id: ResourceId,
    pub driver_id: ResourceId,
}

impl Fulfillment {
    /// Creates a fulfillment record with nothing assigned yet.
    pub fn unassigned(truck_id: ResourceId, driver_id: ResourceId) -> Self {
        Self {
            is_truck_assigned: false,
            is_driver_assigned: false,
            truck_id,
            driver_id,
        }
    }

    /// Returns the reference the order holds for the given kind.
    pub fn resource(&self, kind: ResourceKind) -> &ResourceId {
        match kind {
            ResourceKind::Truck => &self.truck_id,
            ResourceKind::Driver => &self.driver_id,
        }
    }

    /// Returns whether the given kind is confirmed.
    pub fn is_assigned(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Truck => self.is_truck_assigned,
            ResourceKind::Driver => self.is_driver_assigned,
        }
    }

    fn set_assigned(&mut self, kind: ResourceKind, assigned: bool) {
        match kind {
            ResourceKind::Truck => self.is_truck_assigned = assigned,
            ResourceKind::Driver => self.is_driver_assigned = assigned,
        }
    }

    /// Returns true when both truck and driver are confirmed.
    pub fn is_complete(&self) -> bool {
        self.is_truck_assigned && self.is_driver_assigned
    }
}

/// Order aggregate root.
///
/// The order service is its only writer. The status history is append-only:
/// entries are never removed or reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    order_id: OrderId,
    status_history: Vec<StatusEntry>,
    fulfillment: Fulfillment,
}

impl Order {
    /// Places a new order reserving the given truck and driver.
    ///
    /// The references are not validated here; the resource services decide
    /// whether they exist.
    pub fn place(truck_id: ResourceId, driver_id: ResourceId) -> Self {
        Self {
            order_id: OrderId::new(),
            status_history: vec![StatusEntry::now(
                StatusCode::AwaitingConfirmation,
                AWAITING_CONFIRMATION,
            )],
            fulfillment: Fulfillment::unassigned(truck_id, driver_id),
        }
    }

    pub fn id(&self) -> OrderId {
        self.order_id
    }

    pub fn status_history(&self) -> &[StatusEntry] {
        &self.status_history
    }

    pub fn fulfillment(&self) -> &Fulfillment {
        &self.fulfillment
    }

    /// Returns the most recent status code.
    pub fn current_status(&self) -> StatusCode {
        self.status_history
            .last()
            .map(|entry| entry.code)
            .unwrap_or(StatusCode::AwaitingConfirmation)
    }

    /// When the order was placed.
    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.status_history.first().map(|entry| entry.timestamp)
    }

    /// Returns true once the order has been confirmed for fulfillment.
    pub fn is_ready(&self) -> bool {
        self.has_status(StatusCode::InFulfillment)
    }

    /// Returns true once any conflict has been recorded.
    pub fn is_cancelled(&self) -> bool {
        self.has_status(StatusCode::Conflicted)
    }

    /// Returns true while the order is neither ready nor cancelled.
    pub fn is_pending(&self) -> bool {
        !self.current_status().is_terminal()
    }

    fn has_status(&self, code: StatusCode) -> bool {
        self.status_history.iter().any(|entry| entry.code == code)
    }

    /// Records that a resource service assigned its resource, then runs the
    /// confirmation check.
    ///
    /// Returns true if this call moved the order into fulfillment. An order
    /// is confirmed at most once, and never after a conflict.
    pub fn record_assignment(&mut self, kind: ResourceKind) -> bool {
        self.fulfillment.set_assigned(kind, true);

        if !self.fulfillment.is_complete() || self.current_status().is_terminal() {
            return false;
        }

        self.status_history.push(StatusEntry::now(
            StatusCode::InFulfillment,
            IN_FULFILLMENT,
        ));
        true
    }

    /// Records that a resource service rejected the order.
    ///
    /// Always appends a conflict entry carrying the reason; the caller
    /// cancels the order regardless of the other resource's state.
    pub fn record_conflict(&mut self, kind: ResourceKind, reason: impl Into<String>) {
        self.fulfillment.set_assigned(kind, false);
        self.status_history
            .push(StatusEntry::now(StatusCode::Conflicted, reason));
    }

    /// Cancels the order if it is still pending after `timeout`.
    ///
    /// Returns true if a conflict entry was appended.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let stale = self
            .placed_at()
            .is_some_and(|placed| now - placed >= timeout);

        if !stale || !self.is_pending() {
            return false;
        }

        self.status_history.push(StatusEntry::now(
            StatusCode::Conflicted,
            CONFIRMATION_TIMED_OUT,
        ));
        true
    }
}
