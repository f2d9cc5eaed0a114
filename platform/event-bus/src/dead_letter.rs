//! Dead-letter capture for events whose handlers exhausted their retries
//!
//! Failed events are never dropped: after in-process retries run out the
//! event is recorded here with its failure reason and stays queryable until
//! an operator sweep republishes it or it exceeds the redelivery cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{BusResult, Event};

/// Lifecycle of a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Waiting for a redelivery sweep
    Pending,
    /// Republished by a sweep
    Republished,
    /// Redelivery cap reached, frozen for manual inspection
    DeadLettered,
}

/// One captured failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub record_id: Uuid,
    /// The event as it was delivered (including its attempt_count)
    pub event: Event,
    /// Subscription queue whose handler failed
    pub queue_name: String,
    pub last_error: String,
    pub status: DeadLetterStatus,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// Counts by status, for the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub pending: u64,
    pub republished: u64,
    pub dead_lettered: u64,
}

/// Store for failed events.
///
/// `max_redeliveries` is a property of the store, not the caller: a failure
/// whose event already carries `attempt_count >= max_redeliveries` is frozen
/// as `DeadLettered` instead of queued for another sweep.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Capture a failed delivery. Returns the stored record.
    async fn record_failure(
        &self,
        event: &Event,
        queue_name: &str,
        error: &str,
    ) -> BusResult<DeadLetterRecord>;

    /// Records awaiting redelivery.
    async fn pending(&self) -> BusResult<Vec<DeadLetterRecord>>;

    /// Mark a record republished. Returns `false` if the id is unknown or the
    /// record is not pending.
    async fn mark_republished(&self, record_id: &Uuid) -> BusResult<bool>;

    async fn get(&self, record_id: &Uuid) -> BusResult<Option<DeadLetterRecord>>;

    async fn stats(&self) -> BusResult<DeadLetterStats>;
}

/// In-memory reference implementation.
pub struct InMemoryDeadLetterStore {
    records: Arc<RwLock<HashMap<Uuid, DeadLetterRecord>>>,
    max_redeliveries: u32,
}

impl InMemoryDeadLetterStore {
    /// Default redelivery cap of 3 sweeps per logical event.
    pub fn new() -> Self {
        Self::with_max_redeliveries(3)
    }

    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            max_redeliveries,
        }
    }
}

impl Default for InMemoryDeadLetterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record_failure(
        &self,
        event: &Event,
        queue_name: &str,
        error: &str,
    ) -> BusResult<DeadLetterRecord> {
        let now = Utc::now();
        let status = if event.attempt_count >= self.max_redeliveries {
            DeadLetterStatus::DeadLettered
        } else {
            DeadLetterStatus::Pending
        };

        let record = DeadLetterRecord {
            record_id: Uuid::new_v4(),
            event: event.clone(),
            queue_name: queue_name.to_string(),
            last_error: error.to_string(),
            status,
            first_failed_at: now,
            last_failed_at: now,
        };

        if status == DeadLetterStatus::DeadLettered {
            tracing::error!(
                event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                topic = %event.topic(),
                queue = %queue_name,
                attempts = event.attempt_count,
                "Event exceeded redelivery cap, dead-lettered"
            );
        } else {
            tracing::warn!(
                event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                topic = %event.topic(),
                queue = %queue_name,
                error = %error,
                "Event captured for redelivery"
            );
        }

        self.records
            .write()
            .await
            .insert(record.record_id, record.clone());
        Ok(record)
    }

    async fn pending(&self) -> BusResult<Vec<DeadLetterRecord>> {
        let records = self.records.read().await;
        let mut pending: Vec<_> = records
            .values()
            .filter(|r| r.status == DeadLetterStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.first_failed_at);
        Ok(pending)
    }

    async fn mark_republished(&self, record_id: &Uuid) -> BusResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(record_id) {
            Some(record) if record.status == DeadLetterStatus::Pending => {
                record.status = DeadLetterStatus::Republished;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, record_id: &Uuid) -> BusResult<Option<DeadLetterRecord>> {
        Ok(self.records.read().await.get(record_id).cloned())
    }

    async fn stats(&self) -> BusResult<DeadLetterStats> {
        let records = self.records.read().await;
        let mut stats = DeadLetterStats::default();
        for record in records.values() {
            match record.status {
                DeadLetterStatus::Pending => stats.pending += 1,
                DeadLetterStatus::Republished => stats.republished += 1,
                DeadLetterStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
