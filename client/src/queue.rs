//! Durable operation queue and sync orchestration.
//!
//! Every user action lands in the durable queue before anything touches the
//! network. [`OperationQueue::drain`] delivers queued operations to the
//! server: scopes drain concurrently, operations within a scope drain
//! strictly in enqueue order so causal order is preserved. Retryable
//! failures back off exponentially; exhausted or non-retryable operations
//! are dead-lettered, never dropped.
//!
//! Version conflicts reported by the server run through the engine's
//! conflict detection and default resolution, and the outcome is persisted
//! alongside the affected entity.

use crate::cache::CacheManager;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{ClientError, Result};
use crate::store::{
    DurableStore, StoredEntity, TypedStore, CONFLICT_ARCHIVE_STORE, CONFLICT_STORE, ENTITY_STORE,
    QUEUE_STORE, STATE_STORE,
};
use crate::transport::{PushOutcome, RemoteRecord, RemoteTransport};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{
    backoff_delay_ms, detect_conflict, Conflict, ConflictId, EntityState, ErrorClass, OperationKind,
    OperationStatus, Resolution, ResolutionStrategy, ScopeId, StatusEvent, SyncOperation,
    SyncState, SyncStatus, Timestamp,
};
use tokio::sync::mpsc;

/// Identifier handed out by [`OperationQueue::subscribe`].
pub type SubscriptionId = u64;

/// What one drain accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations acknowledged and removed from the queue
    pub pushed: usize,
    /// Divergences recorded as conflicts
    pub conflicts: usize,
    /// Operations dead-lettered this drain
    pub failed: usize,
    /// The drain did not run (offline, or another drain was in progress)
    pub skipped: bool,
}

/// What one pull accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Remote records applied to local state
    pub applied: usize,
    /// Remote records that collided with pending local work
    pub conflicts: usize,
}

/// The durable mutation queue and its sync loop.
pub struct OperationQueue {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn RemoteTransport>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    online: AtomicBool,
    last_stamp: AtomicU64,
    subscribers: DashMap<SubscriptionId, mpsc::UnboundedSender<StatusEvent>>,
    next_subscription: AtomicU64,
    drain_lock: tokio::sync::Mutex<()>,
}

impl OperationQueue {
    pub fn new(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn RemoteTransport>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            config,
            online: AtomicBool::new(false),
            last_stamp: AtomicU64::new(0),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(0),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Flip connectivity. Going online does not drain by itself; callers
    /// decide when to call [`drain`](Self::drain).
    pub async fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let pending = self.pending().await.map(|ops| ops.len()).unwrap_or(0);
        let status = if online {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        };
        self.emit(StatusEvent::new(status, pending));
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Queue one mutation. The operation is durable before this returns.
    ///
    /// Enqueue stamps are strictly increasing within this queue even if the
    /// wall clock stalls or steps backwards.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_id: impl Into<String>,
        payload: Value,
        scope_id: impl Into<ScopeId>,
    ) -> Result<SyncOperation> {
        let operation = SyncOperation::new(
            uuid::Uuid::new_v4().to_string(),
            kind,
            entity_id,
            payload,
            scope_id,
            self.next_stamp(),
        );
        self.store
            .put_typed(QUEUE_STORE, &operation.id, &operation)
            .await?;
        tracing::debug!(
            id = %operation.id,
            kind = ?operation.kind,
            scope = %operation.scope_id,
            "operation enqueued"
        );
        Ok(operation)
    }

    /// Deliverable operations, in drain order.
    pub async fn pending(&self) -> Result<Vec<SyncOperation>> {
        let mut ops: Vec<SyncOperation> = self
            .store
            .get_all_typed::<SyncOperation>(QUEUE_STORE)
            .await?
            .into_iter()
            .filter(|op| op.status != OperationStatus::Failed)
            .collect();
        ops.sort();
        Ok(ops)
    }

    /// Dead-lettered operations awaiting inspection or re-drive.
    pub async fn failed_operations(&self) -> Result<Vec<SyncOperation>> {
        let mut ops: Vec<SyncOperation> = self
            .store
            .get_all_typed::<SyncOperation>(QUEUE_STORE)
            .await?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .collect();
        ops.sort();
        Ok(ops)
    }

    /// Put a dead-lettered operation back in line with a fresh retry budget.
    pub async fn retry_failed(&self, id: &str) -> Result<SyncOperation> {
        let mut operation: SyncOperation = self
            .store
            .get_typed(QUEUE_STORE, id)
            .await?
            .ok_or_else(|| ClientError::OperationNotFound(id.to_string()))?;

        if operation.status == OperationStatus::Failed {
            operation.status = OperationStatus::Pending;
            operation.retry_count = 0;
            self.store.put_typed(QUEUE_STORE, id, &operation).await?;
        }
        Ok(operation)
    }

    /// Register a status listener. Events are delivered unbuffered; a
    /// receiver that falls away is unregistered on the next emit.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<StatusEvent>) {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(&id);
    }

    /// Deliver every deliverable operation.
    ///
    /// Scopes drain concurrently; within a scope delivery is sequential and
    /// in enqueue order. A drain already in progress, or being offline,
    /// yields a skipped report rather than an error.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        let ops = self.pending().await?;
        if !self.is_online() {
            self.emit(StatusEvent::new(SyncStatus::Offline, ops.len()));
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }

        self.emit(StatusEvent::new(SyncStatus::Syncing, ops.len()));

        let mut by_scope: BTreeMap<ScopeId, Vec<SyncOperation>> = BTreeMap::new();
        for op in ops {
            by_scope.entry(op.scope_id.clone()).or_default().push(op);
        }

        let outcomes = futures::future::join_all(
            by_scope
                .into_iter()
                .map(|(scope, ops)| self.drain_scope(scope, ops)),
        )
        .await;

        let mut report = DrainReport::default();
        for outcome in outcomes {
            let (pushed, conflicts, failed) = outcome?;
            report.pushed += pushed;
            report.conflicts += conflicts;
            report.failed += failed;
        }

        let remaining = self.pending().await?.len();
        if report.failed > 0 {
            self.emit(StatusEvent::new(SyncStatus::Error, remaining));
        } else {
            self.emit(StatusEvent::new(SyncStatus::Success, remaining));
            self.emit(StatusEvent::new(SyncStatus::Idle, remaining));
        }
        Ok(report)
    }

    /// Fetch authoritative changes for one scope and fold them into local
    /// state and the cache.
    ///
    /// A remote record whose entity has pending local work is not applied
    /// blindly; the divergence runs through conflict detection instead.
    pub async fn sync_pull(&self, scope_id: &str, cache: &CacheManager) -> Result<PullReport> {
        if !self.is_online() {
            let pending = self.pending().await?.len();
            self.emit(StatusEvent::new(SyncStatus::Offline, pending));
            return Ok(PullReport::default());
        }

        let mut state = self.load_state(scope_id).await?;
        let records = self
            .transport
            .pull(&scope_id.to_string(), state.last_pull_timestamp)
            .await
            .map_err(ClientError::Transport)?;

        let now = self.clock.now_ms();
        let pending = self.pending().await?;
        let mut report = PullReport::default();
        let mut watermark = state.last_pull_timestamp;

        for record in records {
            watermark = watermark.max(record.updated_at);

            let colliding = pending.iter().find(|op| {
                op.scope_id == scope_id
                    && op.entity_id == record.entity_id
                    && op.entity_type() == record.entity_type
            });
            if let Some(op) = colliding {
                if self.record_conflict(op, &record).await? {
                    report.conflicts += 1;
                    continue;
                }
            }

            self.apply_remote(&record, cache).await?;
            report.applied += 1;
        }

        state.last_pull_timestamp = watermark;
        state.is_online = true;
        state.pending_operations = pending
            .iter()
            .filter(|op| op.scope_id == scope_id)
            .count();
        self.store
            .put_typed(STATE_STORE, scope_id, &state)
            .await?;

        tracing::debug!(
            scope = scope_id,
            applied = report.applied,
            conflicts = report.conflicts,
            watermark,
            elapsed_ms = self.clock.now_ms().saturating_sub(now),
            "pull complete"
        );
        Ok(report)
    }

    /// Unresolved-first listing of recorded conflicts.
    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        let mut conflicts: Vec<Conflict> = self.store.get_all_typed(CONFLICT_STORE).await?;
        conflicts.sort_by_key(|c| (c.resolved, c.created_at, c.id.clone()));
        Ok(conflicts)
    }

    /// Resolve one conflict with an explicit strategy and fold the outcome
    /// into local entity state.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_by: &str,
    ) -> Result<Resolution> {
        let mut conflict: Conflict = self
            .store
            .get_typed(CONFLICT_STORE, id)
            .await?
            .ok_or_else(|| {
                ClientError::Engine(tillsync_engine::Error::ConflictNotFound(id.to_string()))
            })?;

        let resolution = conflict.resolve(strategy, resolved_by, self.clock.now_ms());
        self.apply_resolution(&conflict).await?;
        self.store.put_typed(CONFLICT_STORE, id, &conflict).await?;
        Ok(resolution)
    }

    /// Park a conflict for manual resolution.
    pub async fn mark_conflict_manual(&self, id: &str) -> Result<()> {
        let mut conflict: Conflict = self
            .store
            .get_typed(CONFLICT_STORE, id)
            .await?
            .ok_or_else(|| {
                ClientError::Engine(tillsync_engine::Error::ConflictNotFound(id.to_string()))
            })?;
        conflict.mark_manual();
        self.store.put_typed(CONFLICT_STORE, id, &conflict).await?;
        Ok(())
    }

    /// Move resolved conflicts to the archive and prune archive entries past
    /// the retention window. Returns how many conflicts were archived.
    pub async fn archive_resolved(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let conflicts: Vec<Conflict> = self.store.get_all_typed(CONFLICT_STORE).await?;

        let mut archived = 0;
        for conflict in conflicts.into_iter().filter(|c| c.resolved) {
            self.store
                .put_typed(CONFLICT_ARCHIVE_STORE, &conflict.id, &conflict)
                .await?;
            self.store.delete(CONFLICT_STORE, &conflict.id).await?;
            archived += 1;
        }

        let retention = self.config.conflict_retention_ms;
        let archive: Vec<Conflict> = self.store.get_all_typed(CONFLICT_ARCHIVE_STORE).await?;
        for conflict in archive {
            let resolved_at = conflict.resolved_at.unwrap_or(conflict.created_at);
            if now.saturating_sub(resolved_at) >= retention {
                self.store
                    .delete(CONFLICT_ARCHIVE_STORE, &conflict.id)
                    .await?;
            }
        }
        Ok(archived)
    }

    /// Serialize all active conflicts for support tooling.
    pub async fn export_conflicts(&self) -> Result<String> {
        let conflicts = self.conflicts().await?;
        Ok(tillsync_engine::export_conflicts(&conflicts)?)
    }

    async fn drain_scope(
        &self,
        scope_id: ScopeId,
        ops: Vec<SyncOperation>,
    ) -> Result<(usize, usize, usize)> {
        let mut pushed = 0;
        let mut conflicts = 0;
        let mut failed = 0;

        for mut op in ops {
            op.status = OperationStatus::InFlight;
            self.store.put_typed(QUEUE_STORE, &op.id, &op).await?;

            loop {
                match self.transport.push(&op).await {
                    Ok(PushOutcome::Applied { version }) => {
                        self.apply_ack(&op, version).await?;
                        pushed += 1;
                        break;
                    }
                    Ok(PushOutcome::Conflict { remote }) => {
                        if self.record_conflict(&op, &remote).await? {
                            conflicts += 1;
                        }
                        // Either way the server has spoken; the operation is
                        // spent.
                        self.store.delete(QUEUE_STORE, &op.id).await?;
                        break;
                    }
                    Err(error) => {
                        let class = ErrorClass::from_status(error.status);
                        if class.is_retryable() && op.retry_count < self.config.max_retries {
                            let delay = backoff_delay_ms(
                                self.config.backoff_base_ms,
                                op.retry_count,
                                self.config.backoff_cap_ms,
                            );
                            op.retry_count += 1;
                            self.store.put_typed(QUEUE_STORE, &op.id, &op).await?;
                            tracing::debug!(
                                id = %op.id,
                                attempt = op.retry_count,
                                delay_ms = delay,
                                %error,
                                "push failed, retrying"
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            continue;
                        }

                        op.status = OperationStatus::Failed;
                        self.store.put_typed(QUEUE_STORE, &op.id, &op).await?;
                        tracing::warn!(id = %op.id, class = ?class, %error, "operation dead-lettered");
                        self.emit(
                            StatusEvent::new(SyncStatus::Error, 0)
                                .with_scope(scope_id.clone())
                                .with_message(error.to_string()),
                        );
                        failed += 1;
                        break;
                    }
                }
            }
        }

        let mut state = self.load_state(&scope_id).await?;
        state.is_online = true;
        state.pending_operations = self
            .pending()
            .await?
            .iter()
            .filter(|op| op.scope_id == scope_id)
            .count();
        self.store.put_typed(STATE_STORE, &scope_id, &state).await?;

        Ok((pushed, conflicts, failed))
    }

    async fn apply_ack(&self, op: &SyncOperation, version: u64) -> Result<()> {
        self.store.delete(QUEUE_STORE, &op.id).await?;

        let now = self.clock.now_ms();
        let entity = StoredEntity {
            entity_type: op.entity_type(),
            entity_id: op.entity_id.clone(),
            data: op.payload.clone(),
            version,
            updated_at: now,
            deleted: false,
        };
        let key = StoredEntity::key(&entity.entity_type, &entity.entity_id);
        self.store.put_typed(ENTITY_STORE, &key, &entity).await?;

        let mut state = self.load_state(&op.scope_id).await?;
        state.last_push_timestamp = now;
        self.store
            .put_typed(STATE_STORE, &op.scope_id, &state)
            .await?;
        Ok(())
    }

    /// Run the divergence through detection. Returns whether a conflict was
    /// recorded; `false` means local and remote already agree.
    async fn record_conflict(&self, op: &SyncOperation, remote: &RemoteRecord) -> Result<bool> {
        let now = self.clock.now_ms();
        let key = StoredEntity::key(&remote.entity_type, &remote.entity_id);

        let local = match self.store.get_typed::<StoredEntity>(ENTITY_STORE, &key).await? {
            Some(entity) => entity.as_entity_state(),
            None => EntityState::new(
                op.payload.clone(),
                op.payload_version().unwrap_or(0),
                op.enqueued_at,
            ),
        };

        let id: ConflictId = uuid::Uuid::new_v4().to_string();
        let detected = detect_conflict(
            id,
            remote.entity_type.clone(),
            remote.entity_id.clone(),
            op.kind,
            &local,
            Some(&remote.as_entity_state()),
            now,
        );

        let Some(mut conflict) = detected else {
            // The server's copy already matches ours; adopt its version.
            let entity = StoredEntity {
                entity_type: remote.entity_type.clone(),
                entity_id: remote.entity_id.clone(),
                data: remote.data.clone().unwrap_or(Value::Null),
                version: remote.version,
                updated_at: remote.updated_at,
                deleted: remote.deleted,
            };
            self.store.put_typed(ENTITY_STORE, &key, &entity).await?;
            return Ok(false);
        };

        if conflict.is_auto_resolvable() {
            conflict.resolve_default("auto", now);
            self.apply_resolution(&conflict).await?;
        }
        tracing::info!(
            id = %conflict.id,
            kind = ?conflict.kind,
            entity = %key,
            resolved = conflict.resolved,
            "conflict recorded"
        );
        self.store
            .put_typed(CONFLICT_STORE, &conflict.id, &conflict)
            .await?;
        Ok(true)
    }

    async fn apply_resolution(&self, conflict: &Conflict) -> Result<()> {
        let Some(resolution) = conflict.resolution() else {
            return Ok(());
        };
        let (Some(data), Some(version)) = (resolution.data, resolution.version) else {
            return Ok(());
        };

        let entity = StoredEntity {
            entity_type: conflict.entity_type.clone(),
            entity_id: conflict.entity_id.clone(),
            data,
            version,
            updated_at: self.clock.now_ms(),
            deleted: false,
        };
        let key = StoredEntity::key(&entity.entity_type, &entity.entity_id);
        self.store.put_typed(ENTITY_STORE, &key, &entity).await?;
        Ok(())
    }

    async fn apply_remote(&self, record: &RemoteRecord, cache: &CacheManager) -> Result<()> {
        let key = StoredEntity::key(&record.entity_type, &record.entity_id);
        if record.deleted {
            self.store.delete(ENTITY_STORE, &key).await?;
            cache.invalidate(&key).await;
            return Ok(());
        }

        let data = record.data.clone().unwrap_or(Value::Null);
        let entity = StoredEntity {
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            data: data.clone(),
            version: record.version,
            updated_at: record.updated_at,
            deleted: false,
        };
        self.store.put_typed(ENTITY_STORE, &key, &entity).await?;
        cache.put(&key, &record.entity_type, data).await;
        Ok(())
    }

    async fn load_state(&self, scope_id: &str) -> Result<SyncState> {
        Ok(self
            .store
            .get_typed(STATE_STORE, scope_id)
            .await?
            .unwrap_or_else(|| SyncState::new(scope_id)))
    }

    fn next_stamp(&self) -> Timestamp {
        let now = self.clock.now_ms();
        let mut prev = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let stamp = now.max(prev + 1);
            match self.last_stamp.compare_exchange(
                prev,
                stamp,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return stamp,
                Err(actual) => prev = actual,
            }
        }
    }

    fn emit(&self, event: StatusEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}
