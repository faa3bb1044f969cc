//! Resource entity owned by the truck and driver services.

use common::{OrderId, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};

/// A truck or driver that can be held by at most one order at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Police number for trucks, full name for drivers.
    pub name: String,
    pub is_assigned: bool,
    /// The order currently holding the resource, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_order: Option<OrderId>,
}

impl Resource {
    /// Creates a free resource.
    pub fn new(kind: ResourceKind, id: impl Into<ResourceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            is_assigned: false,
            assigned_order: None,
        }
    }

    /// Returns true if the resource is held by `order_id`.
    pub fn is_held_by(&self, order_id: OrderId) -> bool {
        self.is_assigned && self.assigned_order == Some(order_id)
    }
}
