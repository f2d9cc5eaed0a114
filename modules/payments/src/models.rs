use chrono::{DateTime, Utc};
use event_bus::event::BriefReadyForPayment;
use event_bus::PaymentTier;
use serde::{Deserialize, Serialize};

// ============================================================================
// BRIEF
// ============================================================================

/// Finalized customer brief, the input to checkout creation.
///
/// Cached when `brief.ready_for_payment` arrives so the webhook handler can
/// resolve it without calling back upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brief {
    pub brief_id: String,
    /// Correlation id of the transaction that delivered this brief; every
    /// later event and audit entry for the order continues it
    pub correlation_id: String,
    pub conversation_id: String,
    pub business_name: String,
    pub contact_email: String,
    pub tier: PaymentTier,
    pub quoted_amount_cents: i64,
    pub video_duration_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl Brief {
    pub fn from_payload(payload: BriefReadyForPayment, correlation_id: impl Into<String>) -> Self {
        Self {
            brief_id: payload.brief_id,
            correlation_id: correlation_id.into(),
            conversation_id: payload.conversation_id,
            business_name: payload.business_name,
            contact_email: payload.contact_email,
            tier: payload.tier,
            quoted_amount_cents: payload.quoted_amount_cents,
            video_duration_seconds: payload.video_duration_seconds,
            confidence_score: payload.confidence_score,
            received_at: Utc::now(),
        }
    }
}

// ============================================================================
// CHECKOUT SESSION
// ============================================================================

/// Hosted checkout session returned by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
    pub amount_cents: i64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// INBOUND WEBHOOK
// ============================================================================

/// Provider webhook after signature verification, before type dispatch.
///
/// `event_type` is the provider's own vocabulary ("checkout.session.completed"
/// etc.), deliberately kept as a string: the provider can add types we don't
/// know, and the router ignores those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Provider-assigned webhook event id
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// `checkout.session.completed` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCompletedData {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    pub amount_total: i64,
    pub customer_email: String,
    #[serde(default)]
    pub metadata: WebhookMetadata,
}

/// `checkout.session.expired` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExpiredData {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: WebhookMetadata,
}

/// `payment_intent.payment_failed` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: WebhookMetadata,
}

/// `charge.refunded` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRefundedData {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    pub amount_refunded: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Key/value metadata we attach at session creation and read back on webhooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_id: Option<String>,
}

// ============================================================================
// WEBHOOK OUTCOME
// ============================================================================

/// Non-error result of processing one webhook delivery.
///
/// Duplicates and concurrent deliveries are expected operation, not failures;
/// only genuine processing problems surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// This delivery performed the work
    Processed {
        #[serde(skip_serializing_if = "Option::is_none")]
        order_id: Option<String>,
    },
    /// The idempotency record shows the work is already done
    AlreadyProcessed,
    /// Another delivery holds the session lock; this one backed off
    ProcessingElsewhere,
    /// Unrecognized event type, logged and skipped
    Ignored { event_type: String },
}
