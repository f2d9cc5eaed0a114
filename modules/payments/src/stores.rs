//! Store seams for the payment gateway
//!
//! Narrow traits with in-memory reference implementations. Production swaps a
//! networked backend in behind the same trait; nothing above this layer knows
//! the difference.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{GatewayError, GatewayResult};
use crate::models::Brief;
use crate::order::Order;

// ============================================================================
// ORDER STORE
// ============================================================================

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist a snapshot. Rejects stale writes: the incoming version must be
    /// greater than any stored version for the same order.
    async fn save(&self, order: Order) -> GatewayResult<()>;

    async fn get(&self, order_id: &str) -> GatewayResult<Option<Order>>;

    async fn exists(&self, order_id: &str) -> GatewayResult<bool>;

    async fn by_brief_id(&self, brief_id: &str) -> GatewayResult<Option<Order>>;

    async fn by_session_id(&self, session_id: &str) -> GatewayResult<Option<Order>>;

    /// All orders for one customer email, oldest first.
    async fn by_email(&self, email: &str) -> GatewayResult<Vec<Order>>;
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: Order) -> GatewayResult<()> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.get(&order.order_id) {
            if order.version <= existing.version {
                return Err(GatewayError::Store(format!(
                    "stale write for {}: version {} <= stored {}",
                    order.order_id, order.version, existing.version
                )));
            }
        }
        orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn get(&self, order_id: &str) -> GatewayResult<Option<Order>> {
        Ok(self.orders.read().await.get(order_id).cloned())
    }

    async fn exists(&self, order_id: &str) -> GatewayResult<bool> {
        Ok(self.orders.read().await.contains_key(order_id))
    }

    async fn by_brief_id(&self, brief_id: &str) -> GatewayResult<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.brief_id == brief_id)
            .cloned())
    }

    async fn by_session_id(&self, session_id: &str) -> GatewayResult<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| o.session_id == session_id)
            .cloned())
    }

    async fn by_email(&self, email: &str) -> GatewayResult<Vec<Order>> {
        let mut matches: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.customer_email == email)
            .cloned()
            .collect();
        matches.sort_by_key(|o| o.created_at);
        Ok(matches)
    }
}

// ============================================================================
// IDEMPOTENCY STORE
// ============================================================================

/// State of one idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Current or last lock holder
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// A crashed holder's lock is reclaimable after this instant
    pub lock_expires_at: DateTime<Utc>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Whole record evaporates after this instant
    pub record_expires_at: DateTime<Utc>,
}

/// Dual-purpose guard: a short-lived processing lock plus a durable
/// completion record per key.
///
/// `try_acquire`/`release` are holder-scoped so one worker cannot release a
/// lock another worker holds. A completed key can never be re-acquired until
/// the record's TTL expires.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempt to take the processing lock. `true` means this holder may
    /// proceed; a holder re-acquiring its own live lock also gets `true`.
    async fn try_acquire(&self, key: &str, holder: &str) -> GatewayResult<bool>;

    /// Release the lock if this holder owns it. `true` if released.
    async fn release(&self, key: &str, holder: &str) -> GatewayResult<bool>;

    /// Mark the key done. Completion survives release.
    async fn mark_completed(
        &self,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> GatewayResult<()>;

    async fn is_completed(&self, key: &str) -> GatewayResult<bool>;

    async fn get(&self, key: &str) -> GatewayResult<Option<IdempotencyRecord>>;
}

pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    lock_timeout: Duration,
    record_ttl: Duration,
}

impl InMemoryIdempotencyStore {
    /// 30 second lock timeout, 7 day record TTL.
    pub fn new() -> Self {
        Self::with_timeouts(Duration::seconds(30), Duration::days(7))
    }

    pub fn with_timeouts(lock_timeout: Duration, record_ttl: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            lock_timeout,
            record_ttl,
        }
    }

    fn is_expired(record: &IdempotencyRecord, now: DateTime<Utc>) -> bool {
        now >= record.record_expires_at
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_acquire(&self, key: &str, holder: &str) -> GatewayResult<bool> {
        let now = Utc::now();
        let mut records = self.records.write().await;

        if let Some(record) = records.get(key) {
            if Self::is_expired(record, now) {
                records.remove(key);
            } else if record.completed {
                return Ok(false);
            } else if record.holder == holder {
                return Ok(true);
            } else if now < record.lock_expires_at {
                return Ok(false);
            }
            // Lock expired without completion: the holder crashed, reclaim
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                lock_expires_at: now + self.lock_timeout,
                completed: false,
                completed_at: None,
                result: None,
                record_expires_at: now + self.record_ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> GatewayResult<bool> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(record) if record.holder == holder => {
                if record.completed {
                    // Keep the completion record, just drop the lock
                    record.lock_expires_at = now;
                } else {
                    records.remove(key);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &self,
        key: &str,
        result: Option<serde_json::Value>,
    ) -> GatewayResult<()> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        match records.get_mut(key) {
            Some(record) => {
                record.completed = true;
                record.completed_at = Some(now);
                record.result = result;
                Ok(())
            }
            None => Err(GatewayError::Store(format!(
                "cannot complete unheld idempotency key {key}"
            ))),
        }
    }

    async fn is_completed(&self, key: &str) -> GatewayResult<bool> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|r| !Self::is_expired(r, now))
            .map(|r| r.completed)
            .unwrap_or(false))
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|r| !Self::is_expired(r, now))
            .cloned())
    }
}

// ============================================================================
// BRIEF CACHE
// ============================================================================

#[async_trait]
pub trait BriefCache: Send + Sync {
    async fn put(&self, brief: Brief) -> GatewayResult<()>;
    async fn get(&self, brief_id: &str) -> GatewayResult<Option<Brief>>;
    async fn remove(&self, brief_id: &str) -> GatewayResult<()>;
}

pub struct InMemoryBriefCache {
    briefs: Arc<RwLock<HashMap<String, (Brief, DateTime<Utc>)>>>,
    ttl: Duration,
}

impl InMemoryBriefCache {
    /// 24 hour TTL, comfortably longer than a checkout session can live.
    pub fn new() -> Self {
        Self::with_ttl(Duration::hours(24))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            briefs: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }
}

impl Default for InMemoryBriefCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BriefCache for InMemoryBriefCache {
    async fn put(&self, brief: Brief) -> GatewayResult<()> {
        let expires = Utc::now() + self.ttl;
        self.briefs
            .write()
            .await
            .insert(brief.brief_id.clone(), (brief, expires));
        Ok(())
    }

    async fn get(&self, brief_id: &str) -> GatewayResult<Option<Brief>> {
        let now = Utc::now();
        Ok(self
            .briefs
            .read()
            .await
            .get(brief_id)
            .filter(|(_, expires)| now < *expires)
            .map(|(brief, _)| brief.clone()))
    }

    async fn remove(&self, brief_id: &str) -> GatewayResult<()> {
        self.briefs.write().await.remove(brief_id);
        Ok(())
    }
}
