//! # Tillsync Engine
//!
//! The deterministic core of the Tillsync offline synchronization engine.
//!
//! Point-of-sale terminals must keep taking orders with no connectivity and
//! reconcile with the authoritative server later. This crate holds the pure
//! logic that makes that reconciliation predictable: the queued mutation
//! model, conflict detection and resolution, cache TTL/LRU bookkeeping,
//! backoff arithmetic and the error taxonomy. The async runtime around it
//! lives in `tillsync-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of files, network, or timers
//! - **Explicit time**: every time-dependent call takes a `Timestamp`
//! - **Deterministic**: same inputs always produce same outputs
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Sync operations
//!
//! A user action becomes a [`SyncOperation`]: a durable record of one pending
//! mutation, stamped with a monotonically increasing enqueue timestamp and
//! ordered per scope (tenant/branch) so causal order is preserved when the
//! queue drains.
//!
//! ### Conflicts
//!
//! When a push or pull reveals that local and remote state diverged for an
//! entity, [`conflict::detect`] classifies the divergence into a
//! [`ConflictKind`] and produces a [`Conflict`] record. Each kind carries a
//! default [`ResolutionStrategy`]; resolution is idempotent and never deletes
//! the record, only marks it resolved.
//!
//! ### Cache bookkeeping
//!
//! [`CacheIndex`] tracks per-entry TTL and per-entity-type capacity bounds.
//! A read at or past `expires_at` is a miss; exceeding `max_entries` evicts
//! the least-recently-accessed entries first.

pub mod backoff;
pub mod cache;
pub mod classify;
pub mod conflict;
pub mod error;
pub mod operation;
pub mod state;

pub use backoff::backoff_delay_ms;
pub use cache::{CacheEntry, CacheIndex, CachePolicy, CachePriority};
pub use classify::ErrorClass;
pub use conflict::{
    auto_resolve, detect as detect_conflict, export_conflicts, import_conflicts, Conflict,
    ConflictKind, EntityState, Resolution, ResolutionStrategy,
};
pub use error::Error;
pub use operation::{OperationId, OperationKind, OperationStatus, SyncOperation};
pub use state::{StatusEvent, SyncState, SyncStatus};

/// Type aliases for clarity
pub type EntityId = String;
pub type EntityType = String;
pub type ScopeId = String;
pub type ConflictId = String;
pub type Version = u64;
pub type Timestamp = u64;
