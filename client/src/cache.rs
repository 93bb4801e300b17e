//! Cache manager: durable mirroring and the periodic sweep around the
//! engine's `CacheIndex`.
//!
//! Reads and writes go through the in-memory index; after every mutation the
//! full index is mirrored into the durable store so a restart resumes with
//! warm cache state. If mirroring fails the manager logs once and degrades
//! to memory-only for the rest of the process lifetime rather than failing
//! reads.

use crate::clock::Clock;
use crate::store::{DurableStore, TypedStore, CACHE_STORE};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{CacheEntry, CacheIndex, CachePolicy};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Row id of the durable cache mirror.
const MIRROR_KEY: &str = "cache_index";

/// TTL/LRU cache with durable mirroring.
pub struct CacheManager {
    index: Mutex<CacheIndex>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    durable: AtomicBool,
    sweep_interval: Duration,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        policies: Vec<CachePolicy>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            index: Mutex::new(CacheIndex::with_policies(policies)),
            store,
            clock,
            durable: AtomicBool::new(true),
            sweep_interval,
        }
    }

    /// Restore the index from the durable mirror, if one exists.
    pub async fn load(&self) -> crate::error::Result<()> {
        let pairs: Option<Vec<(String, CacheEntry)>> =
            self.store.get_typed(CACHE_STORE, MIRROR_KEY).await?;
        if let Some(pairs) = pairs {
            self.index.lock().await.import(pairs);
        }
        Ok(())
    }

    pub async fn set_policy(&self, policy: CachePolicy) {
        self.index.lock().await.set_policy(policy);
    }

    /// Cache an entity. Evictions needed to stay within the type's capacity
    /// bound happen here, not lazily.
    pub async fn put(&self, key: &str, entity_type: &str, data: Value) {
        let now = self.clock.now_ms();
        let mut index = self.index.lock().await;
        index.put(key, entity_type, data, now);
        self.mirror(&index).await;
    }

    /// Read a cached entity. An expired entry is a miss; the hit path bumps
    /// access statistics, so reads mutate the mirror too.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();
        let mut index = self.index.lock().await;
        let value = index.get(key, now).cloned();
        self.mirror(&index).await;
        value
    }

    /// Drop one entry. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> bool {
        let mut index = self.index.lock().await;
        let removed = index.remove(key);
        if removed {
            self.mirror(&index).await;
        }
        removed
    }

    /// One sweep pass: evict expired entries and re-enforce capacity bounds.
    /// Returns the number of entries evicted. Safe to call concurrently with
    /// the background sweeper.
    pub async fn sweep_once(&self) -> usize {
        let now = self.clock.now_ms();
        let mut index = self.index.lock().await;
        let evicted = index.sweep(now);
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "cache sweep");
            self.mirror(&index).await;
        }
        evicted.len()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Whether mirroring is still active. `false` means a storage failure
    /// degraded the cache to memory-only.
    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    /// Spawn the periodic sweep task. Dropping the handle stops it.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let manager = Arc::clone(self);
        let interval = self.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an index that was loaded a moment ago.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_once().await;
            }
        });
        SweeperHandle { task }
    }

    async fn mirror(&self, index: &CacheIndex) {
        if !self.durable.load(Ordering::SeqCst) {
            return;
        }
        let pairs = index.export();
        if let Err(error) = self.store.put_typed(CACHE_STORE, MIRROR_KEY, &pairs).await {
            tracing::warn!(%error, "cache mirror write failed; continuing memory-only");
            self.durable.store(false, Ordering::SeqCst);
        }
    }
}

/// Handle to the background sweep task.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
