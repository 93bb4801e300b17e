//! Optimistic update controller.
//!
//! The UI reads entity views from here. A mutation applies to the view
//! immediately and is marked tentative until delivery succeeds; on failure
//! the exact pre-mutation snapshot is restored, so a rejected mutation can
//! never leave ghost state behind.

use crate::clock::Clock;
use crate::error::{ClientError, Result};
use crate::queue::OperationQueue;
use crate::transport::{PushOutcome, RemoteTransport};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tillsync_engine::{OperationKind, SyncOperation, Timestamp, Version};

/// How a mutation reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Through the durable queue; delivery happens on the next drain.
    Queued,
    /// Pushed directly, bypassing the queue. Requires connectivity.
    Immediate,
}

/// An entity as the UI currently sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewEntity {
    pub data: Value,
    pub version: Version,
    /// Applied locally but not yet accepted for delivery
    pub tentative: bool,
    pub updated_at: Timestamp,
}

/// Applies mutations to entity views before the server confirms them.
pub struct OptimisticController {
    views: DashMap<String, ViewEntity>,
    queue: Arc<OperationQueue>,
    transport: Arc<dyn RemoteTransport>,
    clock: Arc<dyn Clock>,
}

impl OptimisticController {
    pub fn new(
        queue: Arc<OperationQueue>,
        transport: Arc<dyn RemoteTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            views: DashMap::new(),
            queue,
            transport,
            clock,
        }
    }

    /// Seed a view from authoritative state, replacing any existing view.
    pub fn prime(&self, entity_type: &str, entity_id: &str, data: Value, version: Version) {
        let key = view_key(entity_type, entity_id);
        self.views.insert(
            key,
            ViewEntity {
                data,
                version,
                tentative: false,
                updated_at: self.clock.now_ms(),
            },
        );
    }

    /// The current view of an entity, tentative edits included.
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<ViewEntity> {
        self.views
            .get(&view_key(entity_type, entity_id))
            .map(|v| v.clone())
    }

    /// Apply one mutation optimistically and deliver it.
    ///
    /// On delivery failure the view is restored to its exact pre-mutation
    /// snapshot and the error is returned.
    pub async fn mutate(
        &self,
        kind: OperationKind,
        entity_id: &str,
        payload: Value,
        scope_id: &str,
        mode: DeliveryMode,
    ) -> Result<ViewEntity> {
        let key = view_key(kind.entity_type(), entity_id);
        let snapshot = self.apply_tentative(&key, &payload);

        match self.deliver(kind, entity_id, &payload, scope_id, mode).await {
            Ok(version) => Ok(self.confirm(&key, version)),
            Err(error) => {
                self.restore(&key, snapshot);
                tracing::debug!(entity = %key, %error, "optimistic mutation rolled back");
                Err(error)
            }
        }
    }

    /// Apply several mutations optimistically, then deliver them
    /// concurrently. Only the views of failed deliveries are rolled back;
    /// results come back in input order.
    pub async fn mutate_batch(
        &self,
        mutations: Vec<(OperationKind, String, Value)>,
        scope_id: &str,
        mode: DeliveryMode,
    ) -> Vec<Result<ViewEntity>> {
        let staged: Vec<(String, Option<ViewEntity>)> = mutations
            .iter()
            .map(|(kind, entity_id, payload)| {
                let key = view_key(kind.entity_type(), entity_id);
                let snapshot = self.apply_tentative(&key, payload);
                (key, snapshot)
            })
            .collect();

        let deliveries = mutations
            .iter()
            .map(|(kind, entity_id, payload)| {
                self.deliver(*kind, entity_id, payload, scope_id, mode)
            });
        let outcomes = futures::future::join_all(deliveries).await;

        outcomes
            .into_iter()
            .zip(staged)
            .map(|(outcome, (key, snapshot))| match outcome {
                Ok(version) => Ok(self.confirm(&key, version)),
                Err(error) => {
                    self.restore(&key, snapshot);
                    Err(error)
                }
            })
            .collect()
    }

    /// Overlay the payload on the current view and mark it tentative.
    /// Returns the pre-mutation snapshot.
    fn apply_tentative(&self, key: &str, payload: &Value) -> Option<ViewEntity> {
        let now = self.clock.now_ms();
        let snapshot = self.views.get(key).map(|v| v.clone());

        let next = match &snapshot {
            Some(view) => ViewEntity {
                data: overlay(&view.data, payload),
                version: view.version,
                tentative: true,
                updated_at: now,
            },
            None => ViewEntity {
                data: payload.clone(),
                version: 0,
                tentative: true,
                updated_at: now,
            },
        };
        self.views.insert(key.to_string(), next);
        snapshot
    }

    async fn deliver(
        &self,
        kind: OperationKind,
        entity_id: &str,
        payload: &Value,
        scope_id: &str,
        mode: DeliveryMode,
    ) -> Result<Option<Version>> {
        match mode {
            // Durable enqueue counts as success: the queue guarantees
            // delivery or a recorded conflict from here on.
            DeliveryMode::Queued => {
                self.queue
                    .enqueue(kind, entity_id, payload.clone(), scope_id)
                    .await?;
                Ok(None)
            }
            DeliveryMode::Immediate => {
                let operation = SyncOperation::new(
                    uuid::Uuid::new_v4().to_string(),
                    kind,
                    entity_id,
                    payload.clone(),
                    scope_id,
                    self.clock.now_ms(),
                );
                match self.transport.push(&operation).await? {
                    PushOutcome::Applied { version } => Ok(Some(version)),
                    PushOutcome::Conflict { remote } => {
                        Err(ClientError::Transport(crate::transport::TransportError::new(
                            Some(409),
                            format!(
                                "immediate push of {} rejected at remote version {}",
                                view_key(&remote.entity_type, &remote.entity_id),
                                remote.version
                            ),
                        )))
                    }
                }
            }
        }
    }

    fn confirm(&self, key: &str, version: Option<Version>) -> ViewEntity {
        let now = self.clock.now_ms();
        let mut entry = self
            .views
            .entry(key.to_string())
            .or_insert_with(|| ViewEntity {
                data: Value::Null,
                version: 0,
                tentative: false,
                updated_at: now,
            });
        let view = entry.value_mut();
        if let Some(version) = version {
            view.version = version;
            view.tentative = false;
        } else {
            view.tentative = false;
        }
        view.clone()
    }

    fn restore(&self, key: &str, snapshot: Option<ViewEntity>) {
        match snapshot {
            Some(view) => {
                self.views.insert(key.to_string(), view);
            }
            None => {
                self.views.remove(key);
            }
        }
    }
}

fn view_key(entity_type: &str, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

/// Shallow field overlay: provided fields replace existing ones, including
/// explicit nulls. Non-object payloads replace the view outright.
fn overlay(base: &Value, payload: &Value) -> Value {
    match (base, payload) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::store::{DurableStore, MemoryStore, StoreSchema};
    use crate::transport::{RemoteRecord, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tillsync_engine::ScopeId;

    #[derive(Default)]
    struct MockTransport {
        outcomes: StdMutex<VecDeque<std::result::Result<PushOutcome, TransportError>>>,
    }

    impl MockTransport {
        fn script(&self, outcome: std::result::Result<PushOutcome, TransportError>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }
    }

    #[async_trait]
    impl RemoteTransport for MockTransport {
        async fn push(
            &self,
            _operation: &SyncOperation,
        ) -> std::result::Result<PushOutcome, TransportError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PushOutcome::Applied { version: 1 }))
        }

        async fn pull(
            &self,
            _scope_id: &ScopeId,
            _since: Timestamp,
        ) -> std::result::Result<Vec<RemoteRecord>, TransportError> {
            Ok(Vec::new())
        }
    }

    async fn controller() -> (OptimisticController, Arc<MockTransport>, Arc<OperationQueue>) {
        let store = Arc::new(MemoryStore::new());
        store.init(&StoreSchema::sync_default()).await.unwrap();
        let transport = Arc::new(MockTransport::default());
        let clock = Arc::new(ManualClock::new(1000));
        let queue = Arc::new(OperationQueue::new(
            store,
            transport.clone(),
            clock.clone(),
            SyncConfig::default(),
        ));
        (
            OptimisticController::new(queue.clone(), transport.clone(), clock),
            transport,
            queue,
        )
    }

    #[tokio::test]
    async fn queued_mutation_updates_view_and_enqueues() {
        let (controller, _, queue) = controller().await;
        controller.prime("order", "o1", json!({"total": 10, "note": "x"}), 2);

        let view = controller
            .mutate(
                OperationKind::OrderUpdate,
                "o1",
                json!({"total": 12}),
                "b1",
                DeliveryMode::Queued,
            )
            .await
            .unwrap();

        // Overlay keeps untouched fields and the known version.
        assert_eq!(view.data, json!({"total": 12, "note": "x"}));
        assert_eq!(view.version, 2);
        assert!(!view.tentative);
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn immediate_success_bumps_version() {
        let (controller, transport, _) = controller().await;
        controller.prime("order", "o1", json!({"total": 10}), 2);
        transport.script(Ok(PushOutcome::Applied { version: 3 }));

        let view = controller
            .mutate(
                OperationKind::OrderUpdate,
                "o1",
                json!({"total": 12}),
                "b1",
                DeliveryMode::Immediate,
            )
            .await
            .unwrap();
        assert_eq!(view.version, 3);
        assert!(!view.tentative);
    }

    #[tokio::test]
    async fn immediate_failure_restores_exact_snapshot() {
        let (controller, transport, _) = controller().await;
        controller.prime("order", "o1", json!({"total": 10}), 2);
        let before = controller.get("order", "o1").unwrap();
        transport.script(Err(TransportError::new(Some(500), "boom")));

        let result = controller
            .mutate(
                OperationKind::OrderUpdate,
                "o1",
                json!({"total": 999}),
                "b1",
                DeliveryMode::Immediate,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(controller.get("order", "o1"), Some(before));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_ghost_view() {
        let (controller, transport, _) = controller().await;
        transport.script(Err(TransportError::new(Some(500), "boom")));

        let result = controller
            .mutate(
                OperationKind::OrderCreate,
                "o-new",
                json!({"total": 5}),
                "b1",
                DeliveryMode::Immediate,
            )
            .await;

        assert!(result.is_err());
        assert!(controller.get("order", "o-new").is_none());
    }

    #[tokio::test]
    async fn immediate_conflict_rolls_back_and_surfaces_409() {
        let (controller, transport, _) = controller().await;
        controller.prime("order", "o1", json!({"total": 10}), 2);
        transport.script(Ok(PushOutcome::Conflict {
            remote: RemoteRecord {
                entity_type: "order".into(),
                entity_id: "o1".into(),
                data: Some(json!({"total": 50})),
                version: 9,
                updated_at: 5000,
                deleted: false,
            },
        }));

        let result = controller
            .mutate(
                OperationKind::OrderUpdate,
                "o1",
                json!({"total": 12}),
                "b1",
                DeliveryMode::Immediate,
            )
            .await;

        match result {
            Err(ClientError::Transport(e)) => assert_eq!(e.status, Some(409)),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(
            controller.get("order", "o1").unwrap().data,
            json!({"total": 10})
        );
    }

    #[tokio::test]
    async fn batch_rolls_back_only_failures() {
        let (controller, transport, _) = controller().await;
        controller.prime("order", "o1", json!({"total": 1}), 1);
        controller.prime("order", "o2", json!({"total": 2}), 1);
        transport.script(Ok(PushOutcome::Applied { version: 2 }));
        transport.script(Err(TransportError::new(Some(500), "boom")));

        let results = controller
            .mutate_batch(
                vec![
                    (OperationKind::OrderUpdate, "o1".into(), json!({"total": 11})),
                    (OperationKind::OrderUpdate, "o2".into(), json!({"total": 22})),
                ],
                "b1",
                DeliveryMode::Immediate,
            )
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(
            controller.get("order", "o1").unwrap().data,
            json!({"total": 11})
        );
        assert_eq!(
            controller.get("order", "o2").unwrap().data,
            json!({"total": 2})
        );
    }
}
