//! Remote transport.
//!
//! The queue and the optimistic controller talk to the server through the
//! [`RemoteTransport`] trait. The production implementation is
//! [`HttpTransport`]; tests substitute their own scripted implementations.
//!
//! A version conflict is not a transport error: the server answering 409
//! with the authoritative record is a successful exchange, surfaced as
//! [`PushOutcome::Conflict`] so the caller can run conflict detection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tillsync_engine::{EntityId, EntityType, ScopeId, SyncOperation, Timestamp, Version};

/// The server's view of one entity, as returned by push conflicts and pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Absent for deletions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub version: Version,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    pub fn as_entity_state(&self) -> tillsync_engine::EntityState {
        tillsync_engine::EntityState {
            data: self.data.clone().unwrap_or(Value::Null),
            version: self.version,
            updated_at: self.updated_at,
            deleted: self.deleted,
        }
    }
}

/// Result of delivering one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The server accepted the mutation and assigned a new version.
    Applied { version: Version },
    /// The server rejected the mutation because its copy diverged.
    Conflict { remote: RemoteRecord },
}

/// Delivery failure, carrying the HTTP status when one was received.
///
/// `status: None` means the request never completed (connection refused,
/// timeout, DNS failure) and is always classified as transient.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport failure{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Server-side of the sync protocol.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Deliver one queued operation.
    async fn push(&self, operation: &SyncOperation) -> Result<PushOutcome, TransportError>;

    /// Fetch every record in `scope` changed since `since`.
    async fn pull(
        &self,
        scope_id: &ScopeId,
        since: Timestamp,
    ) -> Result<Vec<RemoteRecord>, TransportError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    operation: &'a SyncOperation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    version: Version,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    records: Vec<RemoteRecord>,
}

/// HTTP implementation of [`RemoteTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn push(&self, operation: &SyncOperation) -> Result<PushOutcome, TransportError> {
        let url = format!("{}/sync/push", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PushRequest { operation })
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 409 {
            let remote: RemoteRecord = response.json().await?;
            return Ok(PushOutcome::Conflict { remote });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::new(Some(status.as_u16()), message));
        }

        let body: PushResponse = response.json().await?;
        Ok(PushOutcome::Applied {
            version: body.version,
        })
    }

    async fn pull(
        &self,
        scope_id: &ScopeId,
        since: Timestamp,
    ) -> Result<Vec<RemoteRecord>, TransportError> {
        let url = format!("{}/sync/pull", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("scopeId", scope_id.as_str()), ("since", &since.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::new(Some(status.as_u16()), message));
        }

        let body: PullResponse = response.json().await?;
        Ok(body.records)
    }
}
