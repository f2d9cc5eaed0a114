//! Delivery agent
//!
//! Consumes payment and production events, keeps the customer informed by
//! email, mints download tokens when production completes, and exchanges
//! presented tokens for short-lived signed URLs.

use std::sync::Arc;

use audit::{AuditEntry, AuditEventType, AuditLog};
use chrono::{DateTime, Utc};
use event_bus::event::{
    DeliveryCompleted, OrderRefunded, PaymentConfirmed, PaymentFailed, ProductionCompleted,
    ProductionFailed, ProductionPhaseComplete, ProductionStarted,
};
use event_bus::{Event, EventBus, EventPayload, PaymentTier};
use uuid::Uuid;

use crate::email::{EmailMessage, EmailSender, TemplateBook};
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::{
    DeliveryToken, DenialReason, DownloadAttempt, NotificationKind, NotificationRecord,
    TierPolicy, TokenStatus,
};
use crate::signer::UrlSigner;
use crate::stores::{DownloadAuditLog, NotificationStore, TokenStore};
use crate::token::TokenMinter;

const COMPONENT: &str = "delivery-agent";

/// Outcome of a successful token exchange.
#[derive(Debug, Clone)]
pub struct ExchangeGrant {
    pub order_id: String,
    pub download_url: String,
    pub url_expires_at: DateTime<Utc>,
    pub downloads_remaining: u32,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base of the customer portal; the raw token is appended as the path
    pub portal_base_url: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, DeliveryError> {
        let portal_base_url = std::env::var("DELIVERY_PORTAL_URL")
            .map_err(|_| DeliveryError::Store("Missing DELIVERY_PORTAL_URL".to_string()))?;
        Ok(Self { portal_base_url })
    }
}

#[derive(Clone)]
pub struct DeliveryAgent {
    bus: Arc<dyn EventBus>,
    tokens: Arc<dyn TokenStore>,
    notifications: Arc<dyn NotificationStore>,
    downloads: Arc<dyn DownloadAuditLog>,
    audit_log: Arc<dyn AuditLog>,
    email: Arc<dyn EmailSender>,
    signer: Arc<dyn UrlSigner>,
    minter: TokenMinter,
    templates: TemplateBook,
    policy: TierPolicy,
    config: AgentConfig,
}

impl DeliveryAgent {
    pub fn new(
        bus: Arc<dyn EventBus>,
        tokens: Arc<dyn TokenStore>,
        notifications: Arc<dyn NotificationStore>,
        downloads: Arc<dyn DownloadAuditLog>,
        audit_log: Arc<dyn AuditLog>,
        email: Arc<dyn EmailSender>,
        signer: Arc<dyn UrlSigner>,
        minter: TokenMinter,
        config: AgentConfig,
    ) -> Self {
        Self {
            bus,
            tokens,
            notifications,
            downloads,
            audit_log,
            email,
            signer,
            minter,
            templates: TemplateBook::default(),
            policy: TierPolicy::default(),
            config,
        }
    }

    /// Dispatch one consumed event. Wired as the agent's bus handler; errors
    /// propagate so the bus retry and dead-letter machinery applies.
    pub async fn handle_event(&self, event: Event) -> DeliveryResult<()> {
        let correlation_id = event.correlation_id.clone();
        match event.payload {
            EventPayload::PaymentConfirmed(p) => {
                self.on_payment_confirmed(&correlation_id, p).await
            }
            EventPayload::PaymentFailed(p) => self.on_payment_failed(&correlation_id, p).await,
            EventPayload::ProductionStarted(p) => {
                self.on_production_started(&correlation_id, p).await
            }
            EventPayload::ProductionPhaseComplete(p) => {
                self.on_production_phase(&correlation_id, p).await
            }
            EventPayload::ProductionCompleted(p) => {
                self.on_production_completed(&correlation_id, p).await
            }
            EventPayload::ProductionFailed(p) => {
                self.on_production_failed(&correlation_id, p).await
            }
            EventPayload::OrderRefunded(p) => self.on_order_refunded(&correlation_id, p).await,
            other => {
                tracing::debug!(topic = %other.topic(), "Delivery agent ignoring topic");
                Ok(())
            }
        }
    }

    // ========================================================================
    // NOTIFICATION HANDLERS
    // ========================================================================

    async fn on_payment_confirmed(
        &self,
        correlation_id: &str,
        payload: PaymentConfirmed,
    ) -> DeliveryResult<()> {
        self.send_notification(
            correlation_id,
            NotificationKind::PaymentConfirmation,
            payload.tier,
            &payload.customer_email,
            Some(&payload.order_id),
            "Payment received",
            serde_json::json!({
                "order_id": payload.order_id,
                "amount_cents": payload.amount_cents,
                "tier": payload.tier,
            }),
        )
        .await
    }

    async fn on_payment_failed(
        &self,
        correlation_id: &str,
        payload: PaymentFailed,
    ) -> DeliveryResult<()> {
        let Some(email) = payload.customer_email.as_deref() else {
            tracing::warn!(
                session_id = %payload.session_id,
                "Payment failure without customer email, nothing to send"
            );
            return Ok(());
        };
        self.send_notification(
            correlation_id,
            NotificationKind::PaymentFailure,
            PaymentTier::Starter,
            email,
            None,
            "Payment unsuccessful",
            serde_json::json!({
                "session_id": payload.session_id,
                "reason": payload.reason,
            }),
        )
        .await
    }

    async fn on_production_started(
        &self,
        correlation_id: &str,
        payload: ProductionStarted,
    ) -> DeliveryResult<()> {
        self.send_notification(
            correlation_id,
            NotificationKind::ProductionUpdate,
            payload.tier,
            &payload.customer_email,
            Some(&payload.order_id),
            "Your video is in production",
            serde_json::json!({
                "order_id": payload.order_id,
                "stage": "started",
                "estimated_completion": payload.estimated_completion,
            }),
        )
        .await
    }

    async fn on_production_phase(
        &self,
        correlation_id: &str,
        payload: ProductionPhaseComplete,
    ) -> DeliveryResult<()> {
        self.send_notification(
            correlation_id,
            NotificationKind::ProductionUpdate,
            payload.tier,
            &payload.customer_email,
            Some(&payload.order_id),
            "Production progress",
            serde_json::json!({
                "order_id": payload.order_id,
                "phase": payload.phase,
                "progress_percent": payload.progress_percent,
            }),
        )
        .await
    }

    async fn on_production_failed(
        &self,
        correlation_id: &str,
        payload: ProductionFailed,
    ) -> DeliveryResult<()> {
        self.send_notification(
            correlation_id,
            NotificationKind::ProductionFailure,
            PaymentTier::Starter,
            &payload.customer_email,
            Some(&payload.order_id),
            "A problem with your order",
            serde_json::json!({
                "order_id": payload.order_id,
                "reason": payload.reason,
            }),
        )
        .await
    }

    // ========================================================================
    // TOKEN MINTING
    // ========================================================================

    async fn on_production_completed(
        &self,
        correlation_id: &str,
        payload: ProductionCompleted,
    ) -> DeliveryResult<()> {
        // Redelivered completion events must not mint a second credential.
        let existing = self
            .tokens
            .by_order(&payload.order_id)
            .await
            .map_err(DeliveryError::Store)?;
        if existing.iter().any(|t| t.status == TokenStatus::Active) {
            tracing::info!(
                order_id = %payload.order_id,
                "Active delivery token already exists, skipping mint"
            );
            return Ok(());
        }

        let minted = self.minter.mint();
        let token = DeliveryToken::issue(
            minted.token_id.clone(),
            minted.token_hash,
            payload.order_id.clone(),
            correlation_id.to_string(),
            payload.tier,
            payload.video_key.clone(),
            &self.policy,
        );
        let portal_expires_at = token.expires_at;
        let max_downloads = token.max_downloads;

        self.tokens
            .save(token.clone())
            .await
            .map_err(DeliveryError::Store)?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation_id,
                    AuditEventType::DeliveryTokenIssued,
                    "delivery_token",
                    &minted.token_id,
                )
                .with_new_state(serde_json::json!({
                    "order_id": payload.order_id,
                    "max_downloads": max_downloads,
                    "expires_at": portal_expires_at,
                })),
            )
            .await?;

        let portal_url = format!(
            "{}/d/{}",
            self.config.portal_base_url.trim_end_matches('/'),
            minted.raw_token
        );

        let sent = self
            .send_notification(
                correlation_id,
                NotificationKind::DeliveryReady,
                payload.tier,
                &payload.customer_email,
                Some(&payload.order_id),
                "Your video is ready",
                serde_json::json!({
                    "order_id": payload.order_id,
                    "portal_url": portal_url,
                    "expires_at": portal_expires_at,
                    "max_downloads": max_downloads,
                }),
            )
            .await;
        if let Err(e) = sent {
            // The raw token exists only in the message that just failed to
            // send. Revoke the credential so a redelivery mints a fresh one
            // instead of skipping the mint.
            self.tokens
                .update(token.revoked())
                .await
                .map_err(DeliveryError::Store)?;
            return Err(e);
        }

        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation_id,
                EventPayload::DeliveryCompleted(DeliveryCompleted {
                    order_id: payload.order_id.clone(),
                    token_id: minted.token_id.clone(),
                    portal_expires_at,
                }),
            ))
            .await?;

        tracing::info!(
            order_id = %payload.order_id,
            token_id = %minted.token_id,
            "Delivery token minted and portal link sent"
        );
        Ok(())
    }

    // ========================================================================
    // REVOCATION
    // ========================================================================

    async fn on_order_refunded(
        &self,
        correlation_id: &str,
        payload: OrderRefunded,
    ) -> DeliveryResult<()> {
        let revoked = self
            .tokens
            .revoke_for_order(&payload.order_id)
            .await
            .map_err(DeliveryError::Store)?;

        for token_id in &revoked {
            self.audit_log
                .append(
                    AuditEntry::new(
                        correlation_id,
                        AuditEventType::DeliveryTokenRevoked,
                        "delivery_token",
                        token_id,
                    )
                    .with_metadata(serde_json::json!({
                        "order_id": payload.order_id,
                        "reason": payload.reason,
                    })),
                )
                .await?;
        }

        tracing::info!(
            order_id = %payload.order_id,
            revoked = revoked.len(),
            "Refund processed, delivery access revoked"
        );
        Ok(())
    }

    // ========================================================================
    // TOKEN EXCHANGE
    // ========================================================================

    /// Exchange a presented raw token for a short-lived download URL.
    ///
    /// Every attempt lands in the download audit, denial or not. Denials come
    /// back as [`DeliveryError::Denied`] with a typed reason.
    pub async fn exchange(
        &self,
        raw_token: &str,
        ip: &str,
        user_agent: Option<&str>,
    ) -> DeliveryResult<ExchangeGrant> {
        let hash = self.minter.hash(raw_token);
        let token = self
            .tokens
            .get_by_hash(&hash)
            .await
            .map_err(DeliveryError::Store)?;

        let Some(token) = token else {
            return self
                .deny(None, DenialReason::NotFound, ip, user_agent, None)
                .await;
        };

        if token.status == TokenStatus::Revoked {
            return self
                .deny(
                    Some(&token),
                    DenialReason::Revoked,
                    ip,
                    user_agent,
                    Some(token.correlation_id.clone()),
                )
                .await;
        }
        if token.status == TokenStatus::Exhausted || token.downloads_remaining() == 0 {
            return self
                .deny(
                    Some(&token),
                    DenialReason::QuotaExhausted,
                    ip,
                    user_agent,
                    Some(token.correlation_id.clone()),
                )
                .await;
        }
        if token.is_expired(Utc::now()) {
            // Lazy expiry: the flip happens on first presentation past the
            // deadline, not on a background job.
            let mut expired = token.clone();
            expired.status = TokenStatus::Expired;
            self.tokens
                .update(expired)
                .await
                .map_err(DeliveryError::Store)?;
            return self
                .deny(
                    Some(&token),
                    DenialReason::Expired,
                    ip,
                    user_agent,
                    Some(token.correlation_id.clone()),
                )
                .await;
        }

        // The store arbitrates the quota; a concurrent exchange may have
        // taken the last download between our read and this point.
        let consumed = self
            .tokens
            .consume_download(&hash)
            .await
            .map_err(DeliveryError::Store)?;
        let Some(updated) = consumed else {
            return self
                .deny(
                    Some(&token),
                    DenialReason::QuotaExhausted,
                    ip,
                    user_agent,
                    Some(token.correlation_id.clone()),
                )
                .await;
        };

        let signed = self
            .signer
            .signed_url(&token.video_key, self.policy.download_link_ttl);

        self.downloads
            .record(DownloadAttempt {
                attempt_id: Uuid::new_v4(),
                token_id: Some(token.token_id.clone()),
                order_id: Some(token.order_id.clone()),
                ip: ip.to_string(),
                user_agent: user_agent.map(|s| s.to_string()),
                success: true,
                failure_reason: None,
                attempted_at: Utc::now(),
            })
            .await
            .map_err(DeliveryError::Store)?;

        self.audit_log
            .append(
                AuditEntry::new(
                    &token.correlation_id,
                    AuditEventType::DownloadSucceeded,
                    "delivery_token",
                    &token.token_id,
                )
                .with_metadata(serde_json::json!({
                    "order_id": token.order_id,
                    "download_count": updated.download_count,
                    "ip": ip,
                })),
            )
            .await?;

        tracing::info!(
            order_id = %token.order_id,
            token_id = %token.token_id,
            downloads_remaining = updated.downloads_remaining(),
            "Download URL issued"
        );

        Ok(ExchangeGrant {
            order_id: token.order_id,
            download_url: signed.url,
            url_expires_at: signed.expires_at,
            downloads_remaining: updated.downloads_remaining(),
        })
    }

    async fn deny(
        &self,
        token: Option<&DeliveryToken>,
        reason: DenialReason,
        ip: &str,
        user_agent: Option<&str>,
        correlation_id: Option<String>,
    ) -> DeliveryResult<ExchangeGrant> {
        self.downloads
            .record(DownloadAttempt {
                attempt_id: Uuid::new_v4(),
                token_id: token.map(|t| t.token_id.clone()),
                order_id: token.map(|t| t.order_id.clone()),
                ip: ip.to_string(),
                user_agent: user_agent.map(|s| s.to_string()),
                success: false,
                failure_reason: Some(reason),
                attempted_at: Utc::now(),
            })
            .await
            .map_err(DeliveryError::Store)?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation_id.unwrap_or_else(|| "unattributed".to_string()),
                    AuditEventType::DownloadDenied,
                    "delivery_token",
                    token.map(|t| t.token_id.as_str()).unwrap_or("unknown"),
                )
                .with_metadata(serde_json::json!({
                    "reason": reason,
                    "ip": ip,
                })),
            )
            .await?;

        tracing::warn!(
            reason = %reason,
            ip = %ip,
            "Download exchange denied"
        );
        Err(DeliveryError::denied(reason))
    }

    // ========================================================================
    // EMAIL PLUMBING
    // ========================================================================

    async fn send_notification(
        &self,
        correlation_id: &str,
        kind: NotificationKind,
        tier: PaymentTier,
        recipient: &str,
        order_id: Option<&str>,
        subject: &str,
        variables: serde_json::Value,
    ) -> DeliveryResult<()> {
        let template_id = self.templates.template_id(kind, tier);
        let message_id = self
            .email
            .send(EmailMessage {
                to: recipient.to_string(),
                template_id: template_id.clone(),
                subject: subject.to_string(),
                variables,
            })
            .await?;

        self.notifications
            .save(NotificationRecord::sent(
                message_id.clone(),
                correlation_id.to_string(),
                recipient.to_string(),
                template_id,
                kind,
                order_id.map(|s| s.to_string()),
            ))
            .await
            .map_err(DeliveryError::Store)?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation_id,
                    AuditEventType::EmailSent,
                    "notification",
                    &message_id,
                )
                .with_metadata(serde_json::json!({
                    "kind": kind,
                    "recipient": recipient,
                    "order_id": order_id,
                })),
            )
            .await?;

        Ok(())
    }
}
