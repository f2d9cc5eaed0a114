//! # Audit Trail
//!
//! Append-only record of every state-changing operation in the pipeline.
//!
//! Each entry captures what changed (entity, previous and new state), which
//! business transaction it belongs to (`correlation_id`), and when. Entries
//! are immutable once appended; the log is the ground truth an operator
//! reconstructs a transaction from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Errors from audit log backends
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    StorageError(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Closed set of auditable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Payment gateway
    CheckoutSessionCreated,
    CheckoutSessionExpired,
    WebhookReceived,
    WebhookRejected,
    WebhookDuplicate,
    PaymentConfirmed,
    PaymentFailed,
    PaymentRefunded,
    OrderCreated,
    OrderStatusChanged,
    // Delivery agent
    DeliveryTokenIssued,
    DeliveryTokenRevoked,
    DownloadSucceeded,
    DownloadDenied,
    EmailSent,
    EmailStatusChanged,
    BounceAlertRaised,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub correlation_id: String,
    pub event_type: AuditEventType,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Who caused the change ("system", a webhook source, an operator)
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        correlation_id: impl Into<String>,
        event_type: AuditEventType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            event_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            previous_state: None,
            new_state: None,
            metadata: None,
            actor: "system".to_string(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_previous_state(mut self, state: serde_json::Value) -> Self {
        self.previous_state = Some(state);
        self
    }

    pub fn with_new_state(mut self, state: serde_json::Value) -> Self {
        self.new_state = Some(state);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// Append-only audit log.
///
/// Implementations must be safe under concurrent writers and must never
/// mutate or drop an appended entry.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> AuditResult<()>;

    /// All entries of one business transaction, in append order.
    async fn by_correlation_id(&self, correlation_id: &str) -> AuditResult<Vec<AuditEntry>>;

    /// All entries touching one entity, in append order.
    async fn by_entity(&self, entity_type: &str, entity_id: &str)
        -> AuditResult<Vec<AuditEntry>>;
}

/// In-memory reference implementation.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries. Handy in tests and health reporting.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> AuditResult<()> {
        tracing::debug!(
            correlation_id = %entry.correlation_id,
            event_type = ?entry.event_type,
            entity = %format!("{}/{}", entry.entity_type, entry.entity_id),
            "Audit entry appended"
        );
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn by_correlation_id(&self, correlation_id: &str) -> AuditResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> AuditResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
