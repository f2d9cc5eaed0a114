//! Email status tracking and bounce alerting
//!
//! The email provider posts status callbacks in batches. Each item refers to
//! a prior send by provider message id. Unknown ids are logged and skipped;
//! the batch never fails as a whole.

use std::sync::Arc;

use audit::{AuditEntry, AuditEventType, AuditLog};
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::DeliveryResult;
use crate::models::{AlertSeverity, DeliveryAlert, EmailStatus, EmailStatusUpdate};
use crate::stores::{AlertSink, NotificationStore};

/// Consecutive-bounce threshold within the lookback window.
const BOUNCE_ALERT_THRESHOLD: u32 = 3;
const BOUNCE_LOOKBACK_DAYS: i64 = 7;

/// Applies provider status callbacks to notification records and raises
/// alerts for repeat bouncers.
pub struct NotificationTracker {
    notifications: Arc<dyn NotificationStore>,
    alerts: Arc<dyn AlertSink>,
    audit_log: Arc<dyn AuditLog>,
}

impl NotificationTracker {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        alerts: Arc<dyn AlertSink>,
        audit_log: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            notifications,
            alerts,
            audit_log,
        }
    }

    /// Map the provider's event vocabulary onto our status set. Unrecognized
    /// events are ignored rather than rejected; providers add kinds.
    fn map_event(event: &str) -> Option<EmailStatus> {
        match event {
            "delivered" => Some(EmailStatus::Delivered),
            "open" => Some(EmailStatus::Opened),
            "click" => Some(EmailStatus::Clicked),
            "bounce" => Some(EmailStatus::Bounced),
            "dropped" => Some(EmailStatus::Dropped),
            _ => None,
        }
    }

    /// Apply one status batch. Returns how many items were applied.
    pub async fn apply_status_batch(
        &self,
        updates: Vec<EmailStatusUpdate>,
    ) -> DeliveryResult<usize> {
        let mut applied = 0;
        for update in updates {
            if self.apply_one(update).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn apply_one(&self, update: EmailStatusUpdate) -> DeliveryResult<bool> {
        let Some(status) = Self::map_event(&update.event) else {
            tracing::debug!(
                event = %update.event,
                message_id = %update.provider_message_id,
                "Ignoring unrecognized email event"
            );
            return Ok(false);
        };

        let at = update.timestamp.unwrap_or_else(Utc::now);
        let record = self
            .notifications
            .update_status(&update.provider_message_id, status, at)
            .await
            .map_err(crate::error::DeliveryError::Store)?;

        let Some(record) = record else {
            tracing::warn!(
                message_id = %update.provider_message_id,
                email = %update.email,
                "Status callback for unknown message, skipping"
            );
            return Ok(false);
        };

        self.audit_log
            .append(
                AuditEntry::new(
                    record.correlation_id.clone(),
                    AuditEventType::EmailStatusChanged,
                    "notification",
                    &record.provider_message_id,
                )
                .with_new_state(serde_json::json!({ "status": status }))
                .with_metadata(serde_json::json!({
                    "email": update.email,
                    "event": update.event,
                })),
            )
            .await?;

        if status == EmailStatus::Bounced {
            self.check_bounce_threshold(&record.recipient, &record.correlation_id)
                .await?;
        }

        Ok(true)
    }

    async fn check_bounce_threshold(
        &self,
        recipient: &str,
        correlation_id: &str,
    ) -> DeliveryResult<()> {
        let since = Utc::now() - Duration::days(BOUNCE_LOOKBACK_DAYS);
        let bounces = self
            .notifications
            .bounces_since(recipient, since)
            .await
            .map_err(crate::error::DeliveryError::Store)?;

        if bounces < BOUNCE_ALERT_THRESHOLD {
            return Ok(());
        }

        let severity = if bounces >= BOUNCE_ALERT_THRESHOLD * 2 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        };

        let alert = DeliveryAlert {
            alert_id: Uuid::new_v4(),
            severity,
            recipient: recipient.to_string(),
            bounce_count: bounces,
            message: format!(
                "{bounces} bounced emails to {recipient} in the last {BOUNCE_LOOKBACK_DAYS} days; \
                 the customer may not be receiving delivery links"
            ),
            raised_at: Utc::now(),
        };

        tracing::warn!(
            recipient = %alert.recipient,
            bounce_count = alert.bounce_count,
            severity = ?alert.severity,
            "Bounce threshold reached, raising alert"
        );

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation_id,
                    AuditEventType::BounceAlertRaised,
                    "recipient",
                    recipient,
                )
                .with_metadata(serde_json::json!({
                    "bounce_count": bounces,
                    "severity": severity,
                })),
            )
            .await?;

        self.alerts
            .raise(alert)
            .await
            .map_err(crate::error::DeliveryError::Store)?;

        Ok(())
    }
}
