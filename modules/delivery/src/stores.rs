//! Storage traits for the delivery module with in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{
    DeliveryAlert, DeliveryToken, DownloadAttempt, EmailStatus, NotificationRecord, TokenStatus,
};

// ============================================================================
// TOKEN STORE
// ============================================================================

/// Tokens are looked up by the HMAC hash of the presented secret. The raw
/// token never reaches storage.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, token: DeliveryToken) -> Result<(), String>;
    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<DeliveryToken>, String>;
    async fn by_order(&self, order_id: &str) -> Result<Vec<DeliveryToken>, String>;
    /// Overwrite the stored token (status flips).
    async fn update(&self, token: DeliveryToken) -> Result<(), String>;
    /// Atomically consume one download if the token is active and has quota
    /// left. Returns the updated token, or `None` when nothing was consumed.
    /// Concurrent exchanges race through here; the store is the arbiter.
    async fn consume_download(&self, token_hash: &str) -> Result<Option<DeliveryToken>, String>;
    /// Mark every non-terminal token for an order as revoked. Returns the
    /// token ids that were flipped.
    async fn revoke_for_order(&self, order_id: &str) -> Result<Vec<String>, String>;
}

pub struct InMemoryTokenStore {
    by_hash: Arc<RwLock<HashMap<String, DeliveryToken>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            by_hash: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn save(&self, token: DeliveryToken) -> Result<(), String> {
        let mut map = self.by_hash.write().await;
        map.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<DeliveryToken>, String> {
        let map = self.by_hash.read().await;
        Ok(map.get(token_hash).cloned())
    }

    async fn by_order(&self, order_id: &str) -> Result<Vec<DeliveryToken>, String> {
        let map = self.by_hash.read().await;
        Ok(map
            .values()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update(&self, token: DeliveryToken) -> Result<(), String> {
        let mut map = self.by_hash.write().await;
        if !map.contains_key(&token.token_hash) {
            return Err(format!("unknown token {}", token.token_id));
        }
        map.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn consume_download(&self, token_hash: &str) -> Result<Option<DeliveryToken>, String> {
        let mut map = self.by_hash.write().await;
        match map.get_mut(token_hash) {
            Some(token)
                if token.status == TokenStatus::Active && token.downloads_remaining() > 0 =>
            {
                *token = token.record_download();
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_for_order(&self, order_id: &str) -> Result<Vec<String>, String> {
        let mut map = self.by_hash.write().await;
        let mut revoked = Vec::new();
        for token in map.values_mut() {
            if token.order_id == order_id
                && matches!(token.status, TokenStatus::Active | TokenStatus::Expired)
            {
                *token = token.revoked();
                revoked.push(token.token_id.clone());
            }
        }
        Ok(revoked)
    }
}

// ============================================================================
// NOTIFICATION STORE
// ============================================================================

/// Sent emails keyed by the provider's message id so that status callbacks
/// can be correlated back to the notification.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn save(&self, record: NotificationRecord) -> Result<(), String>;
    async fn get(&self, provider_message_id: &str) -> Result<Option<NotificationRecord>, String>;
    async fn update_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, String>;
    /// Count bounced notifications for a recipient since the given instant.
    async fn bounces_since(&self, email: &str, since: DateTime<Utc>) -> Result<u32, String>;
}

pub struct InMemoryNotificationStore {
    records: Arc<RwLock<HashMap<String, NotificationRecord>>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn save(&self, record: NotificationRecord) -> Result<(), String> {
        let mut map = self.records.write().await;
        map.insert(record.provider_message_id.clone(), record);
        Ok(())
    }

    async fn get(&self, provider_message_id: &str) -> Result<Option<NotificationRecord>, String> {
        let map = self.records.read().await;
        Ok(map.get(provider_message_id).cloned())
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        status: EmailStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<NotificationRecord>, String> {
        let mut map = self.records.write().await;
        match map.get_mut(provider_message_id) {
            Some(record) => {
                record.status = status;
                record.last_status_at = at;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn bounces_since(&self, email: &str, since: DateTime<Utc>) -> Result<u32, String> {
        let map = self.records.read().await;
        let count = map
            .values()
            .filter(|r| {
                r.recipient == email && r.status == EmailStatus::Bounced && r.last_status_at >= since
            })
            .count();
        Ok(count as u32)
    }
}

// ============================================================================
// DOWNLOAD AUDIT LOG
// ============================================================================

/// Every exchange attempt is recorded, successful or not. Denials for
/// unknown tokens land here with no order attribution.
#[async_trait]
pub trait DownloadAuditLog: Send + Sync {
    async fn record(&self, attempt: DownloadAttempt) -> Result<(), String>;
    async fn for_order(&self, order_id: &str) -> Result<Vec<DownloadAttempt>, String>;
    async fn all(&self) -> Result<Vec<DownloadAttempt>, String>;
}

pub struct InMemoryDownloadAuditLog {
    attempts: Arc<RwLock<Vec<DownloadAttempt>>>,
}

impl InMemoryDownloadAuditLog {
    pub fn new() -> Self {
        Self {
            attempts: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryDownloadAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadAuditLog for InMemoryDownloadAuditLog {
    async fn record(&self, attempt: DownloadAttempt) -> Result<(), String> {
        let mut attempts = self.attempts.write().await;
        attempts.push(attempt);
        Ok(())
    }

    async fn for_order(&self, order_id: &str) -> Result<Vec<DownloadAttempt>, String> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .filter(|a| a.order_id.as_deref() == Some(order_id))
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<DownloadAttempt>, String> {
        let attempts = self.attempts.read().await;
        Ok(attempts.clone())
    }
}

// ============================================================================
// ALERT SINK
// ============================================================================

/// Where operational alerts go. Production would wire this to the on-call
/// channel; tests use the in-memory sink.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: DeliveryAlert) -> Result<(), String>;
}

pub struct InMemoryAlertSink {
    alerts: Arc<RwLock<Vec<DeliveryAlert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self {
            alerts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn alerts(&self) -> Vec<DeliveryAlert> {
        self.alerts.read().await.clone()
    }
}

impl Default for InMemoryAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn raise(&self, alert: DeliveryAlert) -> Result<(), String> {
        let mut alerts = self.alerts.write().await;
        alerts.push(alert);
        Ok(())
    }
}
