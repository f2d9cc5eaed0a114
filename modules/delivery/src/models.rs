use chrono::{DateTime, Duration, Utc};
use event_bus::PaymentTier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// DELIVERY TOKENS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Expired,
    Revoked,
    Exhausted,
}

/// Customer-facing download credential.
///
/// Only the HMAC hash of the raw token is ever stored; the raw value exists
/// once, inside the portal link emailed to the customer. The storage key of
/// the asset never leaves the server except through short-lived signed URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryToken {
    pub token_id: String,
    pub token_hash: String,
    pub order_id: String,
    pub correlation_id: String,
    pub tier: PaymentTier,
    pub video_key: String,
    pub max_downloads: u32,
    pub download_count: u32,
    pub status: TokenStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeliveryToken {
    /// Mint-time construction. Quota and validity come from the tier policy.
    pub fn issue(
        token_id: String,
        token_hash: String,
        order_id: String,
        correlation_id: String,
        tier: PaymentTier,
        video_key: String,
        policy: &TierPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            token_id,
            token_hash,
            order_id,
            correlation_id,
            tier,
            video_key,
            max_downloads: policy.max_downloads(tier),
            download_count: 0,
            status: TokenStatus::Active,
            issued_at: now,
            expires_at: now + policy.portal_validity(tier),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Snapshot after one successful download. Flips to `Exhausted` exactly
    /// when the quota is consumed.
    pub fn record_download(&self) -> Self {
        let mut next = self.clone();
        next.download_count += 1;
        if next.download_count >= next.max_downloads {
            next.status = TokenStatus::Exhausted;
        }
        next
    }

    pub fn revoked(&self) -> Self {
        let mut next = self.clone();
        next.status = TokenStatus::Revoked;
        next
    }

    pub fn downloads_remaining(&self) -> u32 {
        self.max_downloads.saturating_sub(self.download_count)
    }
}

/// Tier-scaled delivery policy.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    /// Validity of a minted portal link, base tier
    pub portal_hours: i64,
    /// Validity of one exchanged download URL
    pub download_link_ttl: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            portal_hours: 168,
            download_link_ttl: Duration::minutes(15),
        }
    }
}

impl TierPolicy {
    pub fn max_downloads(&self, tier: PaymentTier) -> u32 {
        match tier {
            PaymentTier::Starter | PaymentTier::Professional => 10,
            PaymentTier::Enterprise => 50,
        }
    }

    pub fn portal_validity(&self, tier: PaymentTier) -> Duration {
        match tier {
            PaymentTier::Starter | PaymentTier::Professional => {
                Duration::hours(self.portal_hours)
            }
            PaymentTier::Enterprise => Duration::hours(self.portal_hours * 2),
        }
    }
}

// ============================================================================
// DOWNLOAD AUDIT
// ============================================================================

/// Why an exchange was denied. These are customer-facing and appear in the
/// exchange response as well as the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotFound,
    Expired,
    Revoked,
    QuotaExhausted,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::QuotaExhausted => "quota_exhausted",
        };
        f.write_str(s)
    }
}

/// One token-exchange attempt, success or denial. Every attempt is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadAttempt {
    pub attempt_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<DenialReason>,
    pub attempted_at: DateTime<Utc>,
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentConfirmation,
    PaymentFailure,
    ProductionUpdate,
    ProductionFailure,
    DeliveryReady,
}

/// One outbound email, keyed by the provider's message id so inbound status
/// webhooks can find it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub provider_message_id: String,
    /// Business transaction the email belongs to
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub recipient: String,
    pub template_id: String,
    pub kind: NotificationKind,
    pub status: EmailStatus,
    pub sent_at: DateTime<Utc>,
    pub last_status_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn sent(
        provider_message_id: String,
        correlation_id: String,
        recipient: String,
        template_id: String,
        kind: NotificationKind,
        order_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            provider_message_id,
            correlation_id,
            order_id,
            recipient,
            template_id,
            kind,
            status: EmailStatus::Sent,
            sent_at: now,
            last_status_at: now,
        }
    }
}

/// One item of the provider's status webhook batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailStatusUpdate {
    pub provider_message_id: String,
    /// Provider vocabulary: delivered, open, click, bounce, dropped
    pub event: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// ALERTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    High,
    Critical,
}

/// Raised when a recipient keeps bouncing; means paid customers may not be
/// receiving their delivery links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAlert {
    pub alert_id: Uuid,
    pub severity: AlertSeverity,
    pub recipient: String,
    pub bounce_count: u32,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}
