//! # Event Model
//!
//! Platform-wide event contract for all inter-component communication.
//!
//! Every event that crosses a component boundary is an [`Event`]: a fixed
//! envelope (id, correlation, priority, attempt count) around a typed
//! [`EventPayload`]. Topics are a closed enum, so adding a new event kind is a
//! compile-time change and a payload can never be published under the wrong
//! topic.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique per delivery attempt (never reused on retry)
//! - `occurred_at`: ISO 8601 timestamp when the event was generated
//! - `correlation_id`: Links every event of one business transaction
//! - `source_component`: Component that produced the event
//! - `schema_version`: Payload schema version for safe evolution
//! - `priority`: Routing hint, does not affect in-memory ordering
//! - `attempt_count`: Redelivery counter, bumped by dead-letter sweeps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BusError, BusResult};

/// Closed set of topics the pipeline publishes on.
///
/// Wire names are dotted strings (`brief.ready_for_payment`). The enum is the
/// source of truth; string forms exist only for logging and queue naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "brief.ready_for_payment")]
    BriefReadyForPayment,
    #[serde(rename = "payment.session_created")]
    PaymentSessionCreated,
    #[serde(rename = "payment.confirmed")]
    PaymentConfirmed,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.abandoned")]
    PaymentAbandoned,
    #[serde(rename = "order.queued")]
    OrderQueued,
    #[serde(rename = "order.refunded")]
    OrderRefunded,
    #[serde(rename = "production.started")]
    ProductionStarted,
    #[serde(rename = "production.phase_complete")]
    ProductionPhaseComplete,
    #[serde(rename = "production.completed")]
    ProductionCompleted,
    #[serde(rename = "production.failed")]
    ProductionFailed,
    #[serde(rename = "delivery.completed")]
    DeliveryCompleted,
}

impl EventTopic {
    /// Dotted wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BriefReadyForPayment => "brief.ready_for_payment",
            Self::PaymentSessionCreated => "payment.session_created",
            Self::PaymentConfirmed => "payment.confirmed",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentAbandoned => "payment.abandoned",
            Self::OrderQueued => "order.queued",
            Self::OrderRefunded => "order.refunded",
            Self::ProductionStarted => "production.started",
            Self::ProductionPhaseComplete => "production.phase_complete",
            Self::ProductionCompleted => "production.completed",
            Self::ProductionFailed => "production.failed",
            Self::DeliveryCompleted => "delivery.completed",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority hint carried on the envelope.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Customer tier, shared contract between the payment and delivery components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentTier {
    Starter,
    Professional,
    Enterprise,
}

impl PaymentTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for PaymentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PAYLOADS: one struct per topic, flat JSON, additive-only evolution
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefReadyForPayment {
    pub brief_id: String,
    pub conversation_id: String,
    pub business_name: String,
    pub contact_email: String,
    pub tier: PaymentTier,
    pub quoted_amount_cents: i64,
    pub video_duration_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSessionCreated {
    pub brief_id: String,
    pub session_id: String,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub tier: PaymentTier,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmed {
    pub order_id: String,
    pub brief_id: String,
    pub session_id: String,
    pub amount_cents: i64,
    pub tier: PaymentTier,
    pub customer_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_id: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAbandoned {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderQueued {
    pub order_id: String,
    pub brief_id: String,
    pub tier: PaymentTier,
    pub customer_email: String,
    pub delivery_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRefunded {
    pub order_id: String,
    pub session_id: String,
    pub amount_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionStarted {
    pub order_id: String,
    pub customer_email: String,
    pub tier: PaymentTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionPhaseComplete {
    pub order_id: String,
    pub phase: String,
    pub progress_percent: u8,
    pub customer_email: String,
    pub tier: PaymentTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionCompleted {
    pub order_id: String,
    /// Storage key of the finished asset. Never exposed to customers directly.
    pub video_key: String,
    pub customer_email: String,
    pub tier: PaymentTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionFailed {
    pub order_id: String,
    pub reason: String,
    pub customer_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCompleted {
    pub order_id: String,
    pub token_id: String,
    pub portal_expires_at: DateTime<Utc>,
}

/// Typed payload, tagged by topic on the wire.
///
/// The variant determines the topic; there is no way to publish a payload
/// under a mismatched topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data")]
pub enum EventPayload {
    #[serde(rename = "brief.ready_for_payment")]
    BriefReadyForPayment(BriefReadyForPayment),
    #[serde(rename = "payment.session_created")]
    PaymentSessionCreated(PaymentSessionCreated),
    #[serde(rename = "payment.confirmed")]
    PaymentConfirmed(PaymentConfirmed),
    #[serde(rename = "payment.failed")]
    PaymentFailed(PaymentFailed),
    #[serde(rename = "payment.abandoned")]
    PaymentAbandoned(PaymentAbandoned),
    #[serde(rename = "order.queued")]
    OrderQueued(OrderQueued),
    #[serde(rename = "order.refunded")]
    OrderRefunded(OrderRefunded),
    #[serde(rename = "production.started")]
    ProductionStarted(ProductionStarted),
    #[serde(rename = "production.phase_complete")]
    ProductionPhaseComplete(ProductionPhaseComplete),
    #[serde(rename = "production.completed")]
    ProductionCompleted(ProductionCompleted),
    #[serde(rename = "production.failed")]
    ProductionFailed(ProductionFailed),
    #[serde(rename = "delivery.completed")]
    DeliveryCompleted(DeliveryCompleted),
}

impl EventPayload {
    /// Topic this payload belongs to.
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::BriefReadyForPayment(_) => EventTopic::BriefReadyForPayment,
            Self::PaymentSessionCreated(_) => EventTopic::PaymentSessionCreated,
            Self::PaymentConfirmed(_) => EventTopic::PaymentConfirmed,
            Self::PaymentFailed(_) => EventTopic::PaymentFailed,
            Self::PaymentAbandoned(_) => EventTopic::PaymentAbandoned,
            Self::OrderQueued(_) => EventTopic::OrderQueued,
            Self::OrderRefunded(_) => EventTopic::OrderRefunded,
            Self::ProductionStarted(_) => EventTopic::ProductionStarted,
            Self::ProductionPhaseComplete(_) => EventTopic::ProductionPhaseComplete,
            Self::ProductionCompleted(_) => EventTopic::ProductionCompleted,
            Self::ProductionFailed(_) => EventTopic::ProductionFailed,
            Self::DeliveryCompleted(_) => EventTopic::DeliveryCompleted,
        }
    }
}

/// Standard event envelope wrapping every published payload.
///
/// # Examples
///
/// ```rust
/// use event_bus::{Event, EventPayload, EventPriority, PaymentTier};
/// use event_bus::event::OrderQueued;
///
/// let event = Event::new(
///     "payment-gateway",
///     "corr-123",
///     EventPayload::OrderQueued(OrderQueued {
///         order_id: "ORD-1A2B3C4D".to_string(),
///         brief_id: "brief-9".to_string(),
///         tier: PaymentTier::Professional,
///         customer_email: "buyer@example.com".to_string(),
///         delivery_days: 3,
///     }),
/// )
/// .with_priority(EventPriority::High);
///
/// assert_eq!(event.topic().as_str(), "order.queued");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique per delivery attempt, never reused on retry
    pub event_id: Uuid,

    /// ISO 8601 timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Links every event of one business transaction
    pub correlation_id: String,

    /// Component that generated the event (e.g. "payment-gateway")
    pub source_component: String,

    /// Payload schema version
    pub schema_version: String,

    pub priority: EventPriority,

    /// Number of prior delivery attempts for this logical event
    pub attempt_count: u32,

    pub payload: EventPayload,
}

impl Event {
    /// Create a new envelope with a fresh event id and the current time.
    pub fn new(
        source_component: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            correlation_id: correlation_id.into(),
            source_component: source_component.into(),
            schema_version: "1.0".to_string(),
            priority: EventPriority::default(),
            attempt_count: 0,
            payload,
        }
    }

    /// Set the priority hint.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Topic of the wrapped payload.
    pub fn topic(&self) -> EventTopic {
        self.payload.topic()
    }

    /// Build a redelivery of this event: fresh `event_id`, same
    /// `correlation_id` and payload, bumped `attempt_count`.
    ///
    /// Event ids identify delivery attempts, so a retry must never reuse one.
    pub fn retry_of(&self) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    /// Envelope-level validation applied at publish time.
    pub fn validate(&self) -> BusResult<()> {
        if self.correlation_id.is_empty() {
            return Err(BusError::InvalidEvent(
                "correlation_id cannot be empty".to_string(),
            ));
        }
        if self.source_component.is_empty() {
            return Err(BusError::InvalidEvent(
                "source_component cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_payload() -> EventPayload {
        EventPayload::OrderQueued(OrderQueued {
            order_id: "ORD-00000001".to_string(),
            brief_id: "brief-1".to_string(),
            tier: PaymentTier::Starter,
            customer_email: "a@b.com".to_string(),
            delivery_days: 5,
        })
    }

    #[test]
    fn envelope_defaults() {
        let event = Event::new("payment-gateway", "corr-1", queued_payload());

        assert_eq!(event.correlation_id, "corr-1");
        assert_eq!(event.source_component, "payment-gateway");
        assert_eq!(event.priority, EventPriority::Normal);
        assert_eq!(event.attempt_count, 0);
        assert_eq!(event.topic(), EventTopic::OrderQueued);
    }

    #[test]
    fn retry_gets_fresh_event_id_same_correlation() {
        let event = Event::new("payment-gateway", "corr-1", queued_payload());
        let retry = event.retry_of();

        assert_ne!(retry.event_id, event.event_id);
        assert_eq!(retry.correlation_id, event.correlation_id);
        assert_eq!(retry.attempt_count, 1);
        assert_eq!(retry.retry_of().attempt_count, 2);
    }

    #[test]
    fn validate_rejects_empty_correlation() {
        let mut event = Event::new("payment-gateway", "corr-1", queued_payload());
        event.correlation_id.clear();
        assert!(event.validate().is_err());
    }

    #[test]
    fn payload_round_trips_with_topic_tag() {
        let event = Event::new("payment-gateway", "corr-1", queued_payload());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["payload"]["topic"], "order.queued");
        assert_eq!(json["payload"]["data"]["tier"], "starter");

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.topic(), EventTopic::OrderQueued);
    }

    #[test]
    fn priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }
}
