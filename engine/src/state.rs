//! Per-scope sync state and the status events emitted to subscribers.

use crate::{ScopeId, Timestamp};
use serde::{Deserialize, Serialize};

/// Queue status as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Offline,
    Syncing,
    Idle,
    Success,
    Error,
}

/// An event delivered to status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: SyncStatus,
    /// Operations still waiting in the durable queue
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn new(status: SyncStatus, pending: usize) -> Self {
        Self {
            status,
            pending,
            scope_id: None,
            message: None,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<ScopeId>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Durable sync bookkeeping, one record per scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub scope_id: ScopeId,
    pub is_online: bool,
    /// Last time authoritative state was pulled for this scope
    pub last_pull_timestamp: Timestamp,
    /// Last time a queued operation was acknowledged by the server
    pub last_push_timestamp: Timestamp,
    /// Operations still queued for this scope at the end of the last drain
    pub pending_operations: usize,
}

impl SyncState {
    pub fn new(scope_id: impl Into<ScopeId>) -> Self {
        Self {
            scope_id: scope_id.into(),
            is_online: false,
            last_pull_timestamp: 0,
            last_push_timestamp: 0,
            pending_operations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_offline() {
        let state = SyncState::new("branch-1");
        assert!(!state.is_online);
        assert_eq!(state.last_pull_timestamp, 0);
        assert_eq!(state.pending_operations, 0);
    }

    #[test]
    fn event_builders() {
        let event = StatusEvent::new(SyncStatus::Error, 3)
            .with_scope("branch-1")
            .with_message("push rejected");

        assert_eq!(event.status, SyncStatus::Error);
        assert_eq!(event.pending, 3);
        assert_eq!(event.scope_id.as_deref(), Some("branch-1"));
    }

    #[test]
    fn serialization_format() {
        let event = StatusEvent::new(SyncStatus::Syncing, 2);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"syncing\""));
        assert!(!json.contains("scopeId")); // skipped when None
    }
}
