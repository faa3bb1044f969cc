//! Saga events exchanged between the order, truck and driver services.
//!
//! Every event is published on its own topic and keyed by the order ID, so
//! the topic name is the variant tag and the payload carries no tag of its
//! own. Decoding happens once, at the router boundary.

use common::{OrderId, ResourceKind};
use serde::{Deserialize, Serialize};

use crate::order::{Fulfillment, Order, StatusEntry};
use crate::DomainError;

/// Topic that receives messages no handler could accept.
pub const DEAD_LETTER_TOPIC: &str = "dead-letter";

/// The fixed set of broker topics the saga uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    OrderCreated,
    TruckAssigned,
    DriverAssigned,
    TruckConflicted,
    DriverConflicted,
    OrderReady,
    OrderCancelled,
}

impl Topic {
    /// Every topic, in saga order.
    pub const ALL: [Topic; 7] = [
        Topic::OrderCreated,
        Topic::TruckAssigned,
        Topic::DriverAssigned,
        Topic::TruckConflicted,
        Topic::DriverConflicted,
        Topic::OrderReady,
        Topic::OrderCancelled,
    ];

    /// Returns the broker topic name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrderCreated => "order-created",
            Topic::TruckAssigned => "truck-assigned",
            Topic::DriverAssigned => "driver-assigned",
            Topic::TruckConflicted => "truck-conflicted",
            Topic::DriverConflicted => "driver-conflicted",
            Topic::OrderReady => "order-ready",
            Topic::OrderCancelled => "order-cancelled",
        }
    }

    /// The topic a resource service publishes a successful claim on.
    pub fn assigned(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Truck => Topic::TruckAssigned,
            ResourceKind::Driver => Topic::DriverAssigned,
        }
    }

    /// The topic a resource service publishes a rejected claim on.
    pub fn conflicted(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Truck => Topic::TruckConflicted,
            ResourceKind::Driver => Topic::DriverConflicted,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| DomainError::UnknownTopic(s.to_string()))
    }
}

/// Why a resource service rejected a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictCause {
    NotFound,
    AlreadyAssigned,
}

impl ConflictCause {
    /// Builds the human-readable reason recorded in the order history.
    pub fn reason(&self, kind: ResourceKind, resource: impl std::fmt::Display) -> String {
        match self {
            ConflictCause::NotFound => format!("{kind} {resource} not found"),
            ConflictCause::AlreadyAssigned => {
                format!("{kind} {resource} is already assigned to another order")
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCause::NotFound => "not_found",
            ConflictCause::AlreadyAssigned => "already_assigned",
        }
    }
}

/// Payload of `truck-assigned` and `driver-assigned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedData {
    pub order_id: OrderId,
}

/// Payload of `truck-conflicted` and `driver-conflicted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictedData {
    pub order_id: OrderId,
    pub reason: String,
    /// Absent when the publisher does not distinguish rejection kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ConflictCause>,
}

/// Payload of `order-cancelled`.
///
/// The order service publishes the full aggregate; consumers only rely on
/// the order ID, so a bare `{orderId}` payload is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationNotice {
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_history: Vec<StatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment: Option<Fulfillment>,
}

impl From<&Order> for CancellationNotice {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            status_history: order.status_history().to_vec(),
            fulfillment: Some(order.fulfillment().clone()),
        }
    }
}

/// A decoded saga event, one variant per topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    OrderCreated(Order),
    TruckAssigned(AssignedData),
    DriverAssigned(AssignedData),
    TruckConflicted(ConflictedData),
    DriverConflicted(ConflictedData),
    OrderReady(Order),
    OrderCancelled(CancellationNotice),
}

impl SagaEvent {
    /// Returns the topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            SagaEvent::OrderCreated(_) => Topic::OrderCreated,
            SagaEvent::TruckAssigned(_) => Topic::TruckAssigned,
            SagaEvent::DriverAssigned(_) => Topic::DriverAssigned,
            SagaEvent::TruckConflicted(_) => Topic::TruckConflicted,
            SagaEvent::DriverConflicted(_) => Topic::DriverConflicted,
            SagaEvent::OrderReady(_) => Topic::OrderReady,
            SagaEvent::OrderCancelled(_) => Topic::OrderCancelled,
        }
    }

    /// Returns the order this event is about; it is also the message key.
    pub fn order_id(&self) -> OrderId {
        match self {
            SagaEvent::OrderCreated(order) | SagaEvent::OrderReady(order) => order.id(),
            SagaEvent::TruckAssigned(data) | SagaEvent::DriverAssigned(data) => data.order_id,
            SagaEvent::TruckConflicted(data) | SagaEvent::DriverConflicted(data) => data.order_id,
            SagaEvent::OrderCancelled(notice) => notice.order_id,
        }
    }

    /// Decodes a payload received on `topic`.
    pub fn decode(topic: &str, payload: serde_json::Value) -> Result<Self, DomainError> {
        let topic: Topic = topic.parse()?;
        let malformed = |source: serde_json::Error| DomainError::MalformedPayload {
            topic: topic.as_str(),
            source,
        };

        let event = match topic {
            Topic::OrderCreated => {
                SagaEvent::OrderCreated(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::TruckAssigned => {
                SagaEvent::TruckAssigned(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::DriverAssigned => {
                SagaEvent::DriverAssigned(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::TruckConflicted => {
                SagaEvent::TruckConflicted(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::DriverConflicted => {
                SagaEvent::DriverConflicted(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::OrderReady => {
                SagaEvent::OrderReady(serde_json::from_value(payload).map_err(malformed)?)
            }
            Topic::OrderCancelled => {
                SagaEvent::OrderCancelled(serde_json::from_value(payload).map_err(malformed)?)
            }
        };
        Ok(event)
    }

    /// Encodes the payload for publishing.
    pub fn payload(&self) -> Result<serde_json::Value, DomainError> {
        let value = match self {
            SagaEvent::OrderCreated(order) | SagaEvent::OrderReady(order) => {
                serde_json::to_value(order)?
            }
            SagaEvent::TruckAssigned(data) | SagaEvent::DriverAssigned(data) => {
                serde_json::to_value(data)?
            }
            SagaEvent::TruckConflicted(data) | SagaEvent::DriverConflicted(data) => {
                serde_json::to_value(data)?
            }
            SagaEvent::OrderCancelled(notice) => serde_json::to_value(notice)?,
        };
        Ok(value)
    }
}

// Convenience constructors
impl SagaEvent {
    /// Creates the assignment event for a resource kind.
    pub fn assigned(kind: ResourceKind, order_id: OrderId) -> Self {
        let data = AssignedData { order_id };
        match kind {
            ResourceKind::Truck => SagaEvent::TruckAssigned(data),
            ResourceKind::Driver => SagaEvent::DriverAssigned(data),
        }
    }

    /// Creates the conflict event for a resource kind.
    pub fn conflicted(
        kind: ResourceKind,
        order_id: OrderId,
        cause: ConflictCause,
        reason: impl Into<String>,
    ) -> Self {
        let data = ConflictedData {
            order_id,
            reason: reason.into(),
            cause: Some(cause),
        };
        match kind {
            ResourceKind::Truck => SagaEvent::TruckConflicted(data),
            ResourceKind::Driver => SagaEvent::DriverConflicted(data),
        }
    }

    /// Creates the cancellation event for an order.
    pub fn cancelled(order: &Order) -> Self {
        SagaEvent::OrderCancelled(CancellationNotice::from(order))
    }
}
