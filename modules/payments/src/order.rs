//! Order aggregate and its forward-only status machine
//!
//! Transitions produce a new snapshot with `version + 1` and the previous
//! status retained; a stored order is never mutated in place. Skipping states
//! and moving backwards are both illegal, except that `cancelled` and
//! `refunded` are reachable from any non-terminal state.

use chrono::{DateTime, Utc};
use event_bus::PaymentTier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    AwaitingPayment,
    PaymentProcessing,
    PaymentConfirmed,
    PaymentFailed,
    Queued,
    InProduction,
    Completed,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled | Self::Refunded)
    }

    /// Forward edges of the status graph, compensations excluded.
    fn forward_targets(&self) -> &'static [OrderStatus] {
        match self {
            Self::Pending => &[Self::AwaitingPayment],
            Self::AwaitingPayment => {
                &[Self::PaymentProcessing, Self::PaymentConfirmed, Self::PaymentFailed]
            }
            Self::PaymentProcessing => &[Self::PaymentConfirmed, Self::PaymentFailed],
            // A failed payment can be retried with a new session
            Self::PaymentFailed => &[Self::AwaitingPayment],
            Self::PaymentConfirmed => &[Self::Queued],
            Self::Queued => &[Self::InProduction],
            Self::InProduction => &[Self::Completed],
            Self::Completed => &[Self::Delivered],
            Self::Delivered | Self::Cancelled | Self::Refunded => &[],
        }
    }

    /// Whether `next` is a legal move from this status.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Compensating moves are allowed from any non-terminal state
        if matches!(next, Self::Cancelled | Self::Refunded) {
            return true;
        }
        self.forward_targets().contains(&next)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::AwaitingPayment => "awaiting_payment",
            Self::PaymentProcessing => "payment_processing",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::PaymentFailed => "payment_failed",
            Self::Queued => "queued",
            Self::InProduction => "in_production",
            Self::Completed => "completed",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        };
        f.write_str(s)
    }
}

/// One customer order, created when payment is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub brief_id: String,
    pub conversation_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    pub tier: PaymentTier,
    pub amount_cents: i64,
    pub customer_email: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<OrderStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumps by exactly one on every transition
    pub version: u32,
}

impl Order {
    /// Deterministic order id for a brief: same brief, same id, on every
    /// replay. `ORD-` plus the first 8 hex chars of SHA-256, uppercased.
    pub fn order_id_for_brief(brief_id: &str) -> String {
        let digest = Sha256::digest(format!("order:{brief_id}").as_bytes());
        let hex_prefix: String = hex::encode(digest)[..8].to_uppercase();
        format!("ORD-{hex_prefix}")
    }

    /// New order in `payment_confirmed`, version 1.
    pub fn confirmed(
        brief: &crate::models::Brief,
        session_id: impl Into<String>,
        payment_intent_id: Option<String>,
        amount_cents: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: Self::order_id_for_brief(&brief.brief_id),
            brief_id: brief.brief_id.clone(),
            conversation_id: brief.conversation_id.clone(),
            session_id: session_id.into(),
            payment_intent_id,
            tier: brief.tier,
            amount_cents,
            customer_email: brief.contact_email.clone(),
            status: OrderStatus::PaymentConfirmed,
            previous_status: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Pure transition: returns a new snapshot, never mutates `self`.
    pub fn transition_to(&self, next: OrderStatus) -> GatewayResult<Order> {
        if !self.status.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let mut updated = self.clone();
        updated.previous_status = Some(self.status);
        updated.status = next;
        updated.version = self.version + 1;
        updated.updated_at = Utc::now();
        Ok(updated)
    }
}
