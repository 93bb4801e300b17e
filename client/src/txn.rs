//! Client-side transaction coordinator.
//!
//! Multi-entity operations (finalizing an order debits inventory, records a
//! payment and closes the table) must not half-apply on a flaky terminal.
//! The coordinator runs steps strictly in order; when a step exhausts its
//! attempts, every completed step is compensated in reverse order.
//!
//! This is compensation, not locking: a step's effects are visible to
//! concurrent readers before the transaction commits. Rollbacks are
//! best-effort and the sweep always visits every completed step even when
//! an earlier compensation fails.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::Timestamp;
use tokio::sync::Mutex;

type StepFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type StepFn = Box<dyn Fn() -> StepFuture + Send + Sync>;

/// One unit of work inside a transaction, with an optional compensating
/// action.
pub struct TransactionStep {
    pub id: String,
    pub name: String,
    execute: StepFn,
    rollback: Option<StepFn>,
    timeout: Option<Duration>,
}

impl TransactionStep {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            execute: Box::new(move || Box::pin(execute())),
            rollback: None,
            timeout: None,
        }
    }

    /// Compensating action run if a later step fails.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move || Box::pin(rollback())));
        self
    }

    /// Per-attempt deadline. A timed-out attempt counts against the step's
    /// attempt budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for TransactionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_rollback", &self.rollback.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Which part of the protocol the transaction last entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxnPhase {
    /// Steps are executing
    Prepare,
    /// Every step completed; the transaction is being finalized
    Commit,
    /// A failure before any step completed
    Abort,
    /// Compensating completed steps
    Rollback,
}

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxnStatus {
    /// Not all steps have run yet
    Pending,
    /// Every step executed; commit not yet recorded
    Prepared,
    /// Every step completed
    Committed,
    /// The first step failed; nothing was applied, nothing to compensate
    Aborted,
    /// A later step failed and every completed step was compensated
    RolledBack,
    /// A later step failed and at least one compensation also failed;
    /// manual intervention may be needed
    Failed,
}

/// Diagnostic record of one executed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub name: String,
    pub phase: TxnPhase,
    pub status: TxnStatus,
    pub started_at: Timestamp,
    /// Absent while the transaction is still running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// The failure that ended the transaction, if it did not commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-step results, keyed by step name
    pub results: HashMap<String, Value>,
}

impl TransactionRecord {
    pub fn is_committed(&self) -> bool {
        self.status == TxnStatus::Committed
    }
}

/// Runs transactions and retains their outcomes for diagnostics.
pub struct TransactionCoordinator {
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    completed: Mutex<Vec<TransactionRecord>>,
}

impl TransactionCoordinator {
    pub fn new(clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        Self {
            clock,
            config,
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Run `steps` in order. The returned record always reflects the final
    /// outcome; per-step failures do not surface as `Err`.
    pub async fn execute(
        &self,
        name: impl Into<String>,
        steps: Vec<TransactionStep>,
    ) -> TransactionRecord {
        let name = name.into();
        let started_at = self.clock.now_ms();
        let mut results = HashMap::new();
        let mut done: Vec<&TransactionStep> = Vec::new();
        let mut failure: Option<ClientError> = None;

        for step in &steps {
            match self.run_step(step).await {
                Ok(value) => {
                    results.insert(step.name.clone(), value);
                    done.push(step);
                }
                Err(error) => {
                    tracing::warn!(txn = %name, step = %step.name, %error, "step failed");
                    failure = Some(error);
                    break;
                }
            }
        }

        let (phase, status) = match failure {
            None => (TxnPhase::Commit, TxnStatus::Committed),
            Some(_) if done.is_empty() => (TxnPhase::Abort, TxnStatus::Aborted),
            Some(_) => (TxnPhase::Rollback, self.roll_back(&name, &done).await),
        };

        let record = TransactionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            phase,
            status,
            started_at,
            completed_at: Some(self.clock.now_ms()),
            error: failure.map(|e| e.to_string()),
            results,
        };

        let mut completed = self.completed.lock().await;
        completed.push(record.clone());
        record
    }

    /// Retained transaction records, oldest first.
    pub async fn history(&self) -> Vec<TransactionRecord> {
        self.completed.lock().await.clone()
    }

    /// Drop records older than the retention window. Returns how many were
    /// dropped.
    pub async fn gc(&self) -> usize {
        let now = self.clock.now_ms();
        let retention = self.config.txn_retention_ms;
        let mut completed = self.completed.lock().await;
        let before = completed.len();
        completed.retain(|r| {
            now.saturating_sub(r.completed_at.unwrap_or(r.started_at)) < retention
        });
        before - completed.len()
    }

    async fn run_step(&self, step: &TransactionStep) -> Result<Value> {
        let mut last_error = ClientError::step(&step.name, "no attempts made");
        for attempt in 1..=self.config.step_attempts.max(1) {
            let outcome = match step.timeout {
                Some(limit) => match tokio::time::timeout(limit, (step.execute)()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClientError::StepTimeout(step.name.clone())),
                },
                None => (step.execute)().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::debug!(step = %step.name, attempt, %error, "step attempt failed");
                    last_error = error;
                    if attempt < self.config.step_attempts {
                        tokio::time::sleep(self.config.step_retry_delay()).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Compensate completed steps in reverse order. Every step is visited
    /// even when an earlier compensation fails.
    async fn roll_back(&self, txn: &str, done: &[&TransactionStep]) -> TxnStatus {
        let mut clean = true;
        for step in done.iter().rev() {
            let Some(rollback) = &step.rollback else {
                continue;
            };
            if let Err(error) = rollback().await {
                tracing::warn!(txn, step = %step.name, %error, "rollback step failed");
                clean = false;
            }
        }
        if clean {
            TxnStatus::RolledBack
        } else {
            TxnStatus::Failed
        }
    }
}
