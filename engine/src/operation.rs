//! Queued mutation records.
//!
//! Mutations are never applied fire-and-forget: every user action becomes a
//! durable [`SyncOperation`] that survives restarts and is delivered to the
//! server in enqueue order per scope.

use crate::{EntityType, ScopeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Unique identifier for an operation.
pub type OperationId = String;

/// The closed enumeration of mutation kinds a terminal can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    OrderCreate,
    OrderUpdate,
    PaymentCreate,
    InventoryAdjust,
    ShiftOpen,
    ShiftClose,
    TableOpen,
    TableClose,
    CustomerCreate,
    CustomerUpdate,
}

impl OperationKind {
    /// The entity type this mutation targets.
    pub fn entity_type(&self) -> &'static str {
        match self {
            OperationKind::OrderCreate | OperationKind::OrderUpdate => "order",
            OperationKind::PaymentCreate => "payment",
            OperationKind::InventoryAdjust => "inventory",
            OperationKind::ShiftOpen | OperationKind::ShiftClose => "shift",
            OperationKind::TableOpen | OperationKind::TableClose => "table",
            OperationKind::CustomerCreate | OperationKind::CustomerUpdate => "customer",
        }
    }

    /// Whether this mutation creates a new entity.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            OperationKind::OrderCreate
                | OperationKind::PaymentCreate
                | OperationKind::ShiftOpen
                | OperationKind::TableOpen
                | OperationKind::CustomerCreate
        )
    }
}

/// Delivery status of a queued operation.
///
/// Operations are deleted on server acknowledgement, so there is no terminal
/// success state; `Failed` is the dead-letter state and is never cleaned up
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
}

/// A durable record of one pending mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID
    pub id: OperationId,
    /// Mutation kind
    pub kind: OperationKind,
    /// Entity this mutation targets
    pub entity_id: String,
    /// Mutation payload (JSON value)
    pub payload: serde_json::Value,
    /// Tenant/branch scope
    pub scope_id: ScopeId,
    /// Enqueue timestamp, monotonically increasing within a queue
    pub enqueued_at: Timestamp,
    /// Delivery attempts so far
    pub retry_count: u32,
    /// Delivery status
    pub status: OperationStatus,
}

impl SyncOperation {
    /// Create a new pending operation.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        scope_id: impl Into<ScopeId>,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            entity_id: entity_id.into(),
            payload,
            scope_id: scope_id.into(),
            enqueued_at,
            retry_count: 0,
            status: OperationStatus::Pending,
        }
    }

    /// The entity type this operation targets.
    pub fn entity_type(&self) -> EntityType {
        self.kind.entity_type().to_string()
    }

    /// Local version marker carried in the payload, if any.
    pub fn payload_version(&self) -> Option<crate::Version> {
        self.payload.get("version").and_then(|v| v.as_u64())
    }
}

/// Ordering for queue drains: `(enqueued_at, id)`.
///
/// The id tiebreak makes the order total even if two operations ever carry
/// the same stamp.
impl Ord for SyncOperation {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.enqueued_at.cmp(&other.enqueued_at) {
            Ordering::Equal => self.id.cmp(&other.id),
            other => other,
        }
    }
}

impl PartialOrd for SyncOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for SyncOperation {}
