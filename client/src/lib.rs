//! # Tillsync Client
//!
//! The async runtime around the [`tillsync-engine`](tillsync_engine) core:
//! durable storage, HTTP transport, the sync loop and its background tasks.
//!
//! A point-of-sale terminal wires the pieces together like this:
//!
//! - a [`DurableStore`](store::DurableStore) holds the queue, conflicts,
//!   cached entities and per-scope sync state across restarts
//! - the [`OperationQueue`](queue::OperationQueue) records every mutation
//!   durably and drains it to the server in causal order per scope
//! - the [`CacheManager`](cache::CacheManager) serves reads with TTL/LRU
//!   bookkeeping and mirrors itself into the store
//! - the [`TransactionCoordinator`](txn::TransactionCoordinator) runs
//!   multi-entity operations with compensation on failure
//! - the [`OptimisticController`](optimistic::OptimisticController) applies
//!   mutations to the UI's entity views before the server confirms them
//!
//! Everything time-dependent takes an injected [`Clock`](clock::Clock), so
//! the whole stack runs deterministically under test.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod optimistic;
pub mod queue;
pub mod store;
pub mod transport;
pub mod txn;

pub use cache::{CacheManager, SweeperHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use error::{ClientError, Result};
pub use optimistic::{DeliveryMode, OptimisticController, ViewEntity};
pub use queue::{DrainReport, OperationQueue, PullReport, SubscriptionId};
pub use store::{
    DurableStore, FileStore, IndexDef, MemoryStore, StoreDef, StoreError, StoreSchema,
    StoredEntity, TypedStore,
};
pub use transport::{HttpTransport, PushOutcome, RemoteRecord, RemoteTransport, TransportError};
pub use txn::{TransactionCoordinator, TransactionRecord, TransactionStep, TxnPhase, TxnStatus};
