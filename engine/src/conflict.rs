//! Conflict detection and resolution.
//!
//! At sync time the queue compares local entity state against the
//! authoritative remote record. [`detect`] classifies any divergence into a
//! [`ConflictKind`]; each kind carries a default [`ResolutionStrategy`]
//! applied by the auto-resolve sweep unless the conflict is explicitly
//! marked manual.
//!
//! Conflicts are inspectable records, never silently deleted. Resolving is a
//! one-way transition: resolving an already-resolved conflict is a no-op
//! returning the existing resolution.

use crate::{
    error::{Error, Result},
    ConflictId, EntityId, EntityType, OperationKind, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One side of a divergence: the entity as the local terminal or the remote
/// server last saw it.
///
/// The version is an explicit monotonically increasing counter; timestamps
/// are kept for last-write-wins resolution only and never used to decide
/// whether two states diverged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub data: Value,
    pub version: Version,
    pub updated_at: Timestamp,
    pub deleted: bool,
}

impl EntityState {
    pub fn new(data: Value, version: Version, updated_at: Timestamp) -> Self {
        Self {
            data,
            version,
            updated_at,
            deleted: false,
        }
    }

    /// A tombstone: the entity was deleted at this version.
    pub fn tombstone(version: Version, updated_at: Timestamp) -> Self {
        Self {
            data: Value::Null,
            version,
            updated_at,
            deleted: true,
        }
    }
}

/// Taxonomy of detected divergences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Local and remote version markers differ
    VersionMismatch,
    /// Versions agree but field-level content differs
    ConcurrentUpdate,
    /// Remote deleted the entity, local still has pending edits
    DeletedModified,
    /// Local deleted the entity, remote has newer edits
    ModifiedDeleted,
    /// A local creation maps to an already-existing remote entity
    DuplicateEntity,
}

impl ConflictKind {
    /// Default strategy applied by the auto-resolve sweep.
    pub fn default_strategy(&self) -> ResolutionStrategy {
        match self {
            ConflictKind::VersionMismatch => ResolutionStrategy::LastWriteWins,
            ConflictKind::ConcurrentUpdate => ResolutionStrategy::LastWriteWins,
            ConflictKind::DeletedModified => ResolutionStrategy::KeepRemote,
            ConflictKind::ModifiedDeleted => ResolutionStrategy::KeepLocal,
            ConflictKind::DuplicateEntity => ResolutionStrategy::Merge,
        }
    }
}

/// How a conflict is (or is to be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// The side with the greater timestamp wins
    LastWriteWins,
    KeepLocal,
    KeepRemote,
    /// Remote as base, local non-null fields overlaid, version bumped past both
    Merge,
    /// Awaiting external input; the sweep skips these
    Manual,
}

/// The outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// `None` for manual resolutions still awaiting input
    pub data: Option<Value>,
    pub version: Option<Version>,
}

/// A detected divergence between local and authoritative remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: ConflictKind,
    pub local_data: Value,
    pub remote_data: Value,
    pub local_version: Version,
    pub remote_version: Version,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    /// The mutation kind whose delivery surfaced the conflict
    pub operation_kind: OperationKind,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub created_at: Timestamp,
}

/// Compare local state against the authoritative remote record.
///
/// Returns `None` when there is no remote record (nothing to diverge from)
/// or when the two sides agree.
pub fn detect(
    id: impl Into<ConflictId>,
    entity_type: impl Into<EntityType>,
    entity_id: impl Into<EntityId>,
    operation_kind: OperationKind,
    local: &EntityState,
    remote: Option<&EntityState>,
    now: Timestamp,
) -> Option<Conflict> {
    let remote = remote?;

    let kind = if remote.deleted && !local.deleted {
        ConflictKind::DeletedModified
    } else if local.deleted && !remote.deleted {
        ConflictKind::ModifiedDeleted
    } else if operation_kind.is_create() {
        ConflictKind::DuplicateEntity
    } else if local.version != remote.version {
        ConflictKind::VersionMismatch
    } else if local.data != remote.data {
        ConflictKind::ConcurrentUpdate
    } else {
        return None;
    };

    Some(Conflict {
        id: id.into(),
        entity_type: entity_type.into(),
        entity_id: entity_id.into(),
        kind,
        local_data: local.data.clone(),
        remote_data: remote.data.clone(),
        local_version: local.version,
        remote_version: remote.version,
        local_timestamp: local.updated_at,
        remote_timestamp: remote.updated_at,
        operation_kind,
        resolved: false,
        resolution_strategy: None,
        resolved_data: None,
        resolved_version: None,
        resolved_at: None,
        resolved_by: None,
        created_at: now,
    })
}

impl Conflict {
    /// Resolve with the given strategy.
    ///
    /// Idempotent: once resolved, later calls return the stored resolution
    /// regardless of the strategy passed. `Manual` records the intent but
    /// leaves the conflict unresolved.
    pub fn resolve(
        &mut self,
        strategy: ResolutionStrategy,
        resolved_by: impl Into<String>,
        now: Timestamp,
    ) -> Resolution {
        if self.resolved {
            return Resolution {
                strategy: self
                    .resolution_strategy
                    .unwrap_or(ResolutionStrategy::Manual),
                data: self.resolved_data.clone(),
                version: self.resolved_version,
            };
        }

        if strategy == ResolutionStrategy::Manual {
            self.resolution_strategy = Some(ResolutionStrategy::Manual);
            return Resolution {
                strategy: ResolutionStrategy::Manual,
                data: None,
                version: None,
            };
        }

        let (data, version) = self.compute(strategy);
        self.resolved = true;
        self.resolution_strategy = Some(strategy);
        self.resolved_data = Some(data.clone());
        self.resolved_version = Some(version);
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.into());

        Resolution {
            strategy,
            data: Some(data),
            version: Some(version),
        }
    }

    /// Resolve with the default strategy for this conflict's kind.
    pub fn resolve_default(&mut self, resolved_by: impl Into<String>, now: Timestamp) -> Resolution {
        self.resolve(self.kind.default_strategy(), resolved_by, now)
    }

    /// Park this conflict for manual resolution. The auto-resolve sweep
    /// skips conflicts marked this way.
    pub fn mark_manual(&mut self) {
        if !self.resolved {
            self.resolution_strategy = Some(ResolutionStrategy::Manual);
        }
    }

    /// Whether the sweep should resolve this conflict.
    pub fn is_auto_resolvable(&self) -> bool {
        !self.resolved && self.resolution_strategy != Some(ResolutionStrategy::Manual)
    }

    /// The stored resolution, if resolved.
    pub fn resolution(&self) -> Option<Resolution> {
        if !self.resolved {
            return None;
        }
        Some(Resolution {
            strategy: self
                .resolution_strategy
                .unwrap_or(ResolutionStrategy::Manual),
            data: self.resolved_data.clone(),
            version: self.resolved_version,
        })
    }

    fn compute(&self, strategy: ResolutionStrategy) -> (Value, Version) {
        match strategy {
            ResolutionStrategy::KeepLocal => (self.local_data.clone(), self.local_version),
            ResolutionStrategy::KeepRemote => (self.remote_data.clone(), self.remote_version),
            ResolutionStrategy::LastWriteWins => {
                if self.remote_timestamp > self.local_timestamp {
                    (self.remote_data.clone(), self.remote_version)
                } else {
                    (self.local_data.clone(), self.local_version)
                }
            }
            ResolutionStrategy::Merge => {
                let merged = merge_fields(&self.remote_data, &self.local_data);
                // New version strictly greater than both inputs.
                let version = self.local_version.max(self.remote_version) + 1;
                (merged, version)
            }
            // Handled before compute is reached.
            ResolutionStrategy::Manual => (Value::Null, self.local_version),
        }
    }
}

/// Remote record as base, every non-null local field overlaid.
fn merge_fields(remote: &Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                if !value.is_null() {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        // Non-object payloads cannot be field-merged; prefer the local side
        // unless it carries nothing.
        (remote, local) => {
            if local.is_null() {
                remote.clone()
            } else {
                local.clone()
            }
        }
    }
}

/// Resolve every auto-resolvable conflict with its kind's default strategy.
///
/// Returns the number of conflicts resolved by this sweep. Safe to run
/// repeatedly; already-resolved and manual conflicts are untouched.
pub fn auto_resolve(conflicts: &mut [Conflict], now: Timestamp) -> usize {
    let mut count = 0;
    for conflict in conflicts.iter_mut() {
        if conflict.is_auto_resolvable() {
            conflict.resolve_default("auto", now);
            count += 1;
        }
    }
    count
}

/// Serialize conflicts as a JSON array of full records, for debugging and
/// support tooling.
pub fn export_conflicts(conflicts: &[Conflict]) -> Result<String> {
    serde_json::to_string(conflicts).map_err(|e| Error::InvalidExport(e.to_string()))
}

/// Parse a JSON array of full conflict records.
pub fn import_conflicts(json: &str) -> Result<Vec<Conflict>> {
    serde_json::from_str(json).map_err(|e| Error::InvalidExport(e.to_string()))
}
