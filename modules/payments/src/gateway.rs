//! Payment gateway orchestration
//!
//! Owns checkout creation and webhook processing. Webhook ingestion is
//! guarded twice: a per-session processing lock keeps concurrent deliveries
//! out of the critical section, and a completion record makes replays
//! harmless after the work is done. The completion mark is only written after
//! every side effect has succeeded, so a crash mid-processing leaves the key
//! unprocessed and a later redelivery finishes the job.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use audit::{AuditEntry, AuditEventType, AuditLog};
use event_bus::event::{
    BriefReadyForPayment, OrderQueued, OrderRefunded, PaymentAbandoned, PaymentConfirmed,
    PaymentFailed, PaymentSessionCreated,
};
use event_bus::{Event, EventBus, EventPayload};

use crate::checkout::{CheckoutProvider, PriceBook};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    Brief, ChargeRefundedData, CheckoutSession, PaymentFailedData, SessionCompletedData,
    SessionExpiredData, WebhookEnvelope, WebhookOutcome,
};
use crate::order::{Order, OrderStatus};
use crate::router::WebhookRouter;
use crate::signature::{self, verify_signature};
use crate::stores::{BriefCache, IdempotencyStore, OrderStore};

const COMPONENT: &str = "payment-gateway";

/// Gateway tunables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub webhook_secret: String,
    pub signature_tolerance_secs: i64,
    /// How long a webhook delivery waits for the session lock before
    /// reporting `ProcessingElsewhere`
    pub lock_wait: Duration,
    pub lock_poll_interval: Duration,
}

impl GatewayConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_tolerance_secs: signature::DEFAULT_TOLERANCE_SECS,
            lock_wait: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
        }
    }
}

struct Core {
    bus: Arc<dyn EventBus>,
    orders: Arc<dyn OrderStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    briefs: Arc<dyn BriefCache>,
    audit_log: Arc<dyn AuditLog>,
    provider: Arc<dyn CheckoutProvider>,
    price_book: PriceBook,
    config: GatewayConfig,
}

/// The payment gateway. Cheap to clone; all state lives behind the stores.
#[derive(Clone)]
pub struct PaymentGateway {
    core: Arc<Core>,
    router: Arc<WebhookRouter>,
}

impl PaymentGateway {
    pub fn new(
        bus: Arc<dyn EventBus>,
        orders: Arc<dyn OrderStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        briefs: Arc<dyn BriefCache>,
        audit_log: Arc<dyn AuditLog>,
        provider: Arc<dyn CheckoutProvider>,
        price_book: PriceBook,
        config: GatewayConfig,
    ) -> Self {
        let core = Arc::new(Core {
            bus,
            orders,
            idempotency,
            briefs,
            audit_log,
            provider,
            price_book,
            config,
        });
        let router = Arc::new(Self::build_router(core.clone()));
        Self { core, router }
    }

    fn build_router(core: Arc<Core>) -> WebhookRouter {
        let completed = core.clone();
        let expired = core.clone();
        let failed = core.clone();
        let refunded = core;
        WebhookRouter::new()
            .register("checkout.session.completed", Arc::new(move |env| {
                let core = completed.clone();
                Box::pin(async move { core.handle_session_completed(env).await })
            }))
            .register("checkout.session.expired", Arc::new(move |env| {
                let core = expired.clone();
                Box::pin(async move { core.handle_session_expired(env).await })
            }))
            .register("payment_intent.payment_failed", Arc::new(move |env| {
                let core = failed.clone();
                Box::pin(async move { core.handle_payment_failed(env).await })
            }))
            .register("charge.refunded", Arc::new(move |env| {
                let core = refunded.clone();
                Box::pin(async move { core.handle_charge_refunded(env).await })
            }))
    }

    /// Consume a `brief.ready_for_payment` payload: cache the brief, open a
    /// checkout session, announce it.
    pub async fn handle_brief_ready(
        &self,
        payload: BriefReadyForPayment,
        correlation_id: &str,
    ) -> GatewayResult<CheckoutSession> {
        self.core.handle_brief_ready(payload, correlation_id).await
    }

    /// Verify a raw webhook delivery and parse its envelope. Runs before any
    /// interpretation of the body; a bad signature has no side effects beyond
    /// an audit entry.
    pub async fn verify_and_parse(
        &self,
        body: &[u8],
        signature_header: &str,
    ) -> GatewayResult<WebhookEnvelope> {
        if let Err(e) = verify_signature(
            body,
            signature_header,
            &self.core.config.webhook_secret,
            self.core.config.signature_tolerance_secs,
        ) {
            tracing::warn!(error = %e, "Webhook rejected, signature verification failed");
            self.core
                .audit_log
                .append(
                    AuditEntry::new("unverified", AuditEventType::WebhookRejected, "webhook", "-")
                        .with_metadata(serde_json::json!({"reason": e.to_string()}))
                        .with_actor("payment-provider"),
                )
                .await?;
            return Err(e.into());
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| GatewayError::MalformedWebhook(e.to_string()))?;

        self.core
            .audit_log
            .append(
                AuditEntry::new(
                    envelope.id.clone(),
                    AuditEventType::WebhookReceived,
                    "webhook",
                    envelope.id.clone(),
                )
                .with_metadata(serde_json::json!({"event_type": envelope.event_type}))
                .with_actor("payment-provider"),
            )
            .await?;

        Ok(envelope)
    }

    /// Route a verified webhook to its handler.
    pub async fn process_webhook(&self, envelope: WebhookEnvelope) -> GatewayResult<WebhookOutcome> {
        self.router.dispatch(envelope).await
    }
}

impl Core {
    async fn handle_brief_ready(
        &self,
        payload: BriefReadyForPayment,
        correlation_id: &str,
    ) -> GatewayResult<CheckoutSession> {
        let brief = Brief::from_payload(payload, correlation_id);
        self.briefs.put(brief.clone()).await?;

        let session = self.provider.create_session(&brief).await?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation_id,
                    AuditEventType::CheckoutSessionCreated,
                    "checkout_session",
                    session.session_id.clone(),
                )
                .with_new_state(serde_json::json!({
                    "brief_id": brief.brief_id,
                    "amount_cents": session.amount_cents,
                    "expires_at": session.expires_at,
                })),
            )
            .await?;

        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation_id,
                EventPayload::PaymentSessionCreated(PaymentSessionCreated {
                    brief_id: brief.brief_id.clone(),
                    session_id: session.session_id.clone(),
                    checkout_url: session.checkout_url.clone(),
                    amount_cents: session.amount_cents,
                    tier: brief.tier,
                    expires_at: session.expires_at,
                }),
            ))
            .await?;

        tracing::info!(
            brief_id = %brief.brief_id,
            session_id = %session.session_id,
            "Brief admitted to checkout"
        );
        Ok(session)
    }

    async fn handle_session_completed(
        &self,
        envelope: WebhookEnvelope,
    ) -> GatewayResult<WebhookOutcome> {
        let data: SessionCompletedData = serde_json::from_value(envelope.data)
            .map_err(|e| GatewayError::MalformedWebhook(e.to_string()))?;

        let brief_id = data.metadata.brief_id.clone().ok_or_else(|| {
            GatewayError::MalformedWebhook("completed session carries no brief_id".to_string())
        })?;
        let key = format!("webhook:{}", data.session_id);

        // Guard one: the completion record
        if self.idempotency.is_completed(&key).await? {
            self.audit_duplicate(&brief_id, &data.session_id).await?;
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        // Guard two: the per-session lock, with a bounded wait
        let holder = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.lock_wait;
        loop {
            if self.idempotency.try_acquire(&key, &holder).await? {
                break;
            }
            if self.idempotency.is_completed(&key).await? {
                self.audit_duplicate(&brief_id, &data.session_id).await?;
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    session_id = %data.session_id,
                    "Session lock not acquired within wait budget, backing off"
                );
                return Ok(WebhookOutcome::ProcessingElsewhere);
            }
            tokio::time::sleep(self.config.lock_poll_interval).await;
        }

        let result = self.process_confirmed_payment(&data, &brief_id).await;
        match result {
            Ok(order_id) => {
                self.idempotency
                    .mark_completed(&key, Some(serde_json::json!({"order_id": order_id})))
                    .await?;
                self.idempotency.release(&key, &holder).await?;
                Ok(WebhookOutcome::Processed {
                    order_id: Some(order_id),
                })
            }
            Err(e) => {
                // Leave the key unprocessed so a redelivery can finish the job
                if !self.idempotency.release(&key, &holder).await.unwrap_or(false) {
                    tracing::error!(session_id = %data.session_id, "Failed to release session lock");
                }
                Err(e)
            }
        }
    }

    /// The critical section: runs with the session lock held.
    async fn process_confirmed_payment(
        &self,
        data: &SessionCompletedData,
        brief_id: &str,
    ) -> GatewayResult<String> {
        let brief = self
            .briefs
            .get(brief_id)
            .await?
            .ok_or_else(|| GatewayError::BriefNotFound(brief_id.to_string()))?;
        let correlation = brief.correlation_id.clone();

        if !self.price_book.amount_matches(brief.tier, data.amount_total) {
            // Reconciliation mismatch is logged, not fatal: the charge already
            // settled and refusing to fulfil would strand the customer
            tracing::warn!(
                session_id = %data.session_id,
                tier = %brief.tier,
                expected_cents = self.price_book.expected_amount(brief.tier),
                charged_cents = data.amount_total,
                "Charged amount does not reconcile with tier pricing"
            );
        }

        // Crash recovery: an order left behind by a partial previous run
        if let Some(existing) = self.orders.by_brief_id(&brief.brief_id).await? {
            if existing.status != OrderStatus::PaymentConfirmed {
                tracing::info!(
                    order_id = %existing.order_id,
                    status = %existing.status,
                    "Order already progressed, treating webhook as satisfied"
                );
                return Ok(existing.order_id);
            }
            return self.queue_order(existing, &correlation).await;
        }

        let order = Order::confirmed(
            &brief,
            &data.session_id,
            data.payment_intent_id.clone(),
            data.amount_total,
        );
        self.orders.save(order.clone()).await?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::PaymentConfirmed,
                    "payment",
                    data.session_id.clone(),
                )
                .with_new_state(serde_json::json!({
                    "amount_cents": data.amount_total,
                    "payment_intent_id": data.payment_intent_id,
                }))
                .with_actor("payment-provider"),
            )
            .await?;
        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::OrderCreated,
                    "order",
                    order.order_id.clone(),
                )
                .with_new_state(serde_json::to_value(&order).unwrap_or_default()),
            )
            .await?;

        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation.clone(),
                EventPayload::PaymentConfirmed(PaymentConfirmed {
                    order_id: order.order_id.clone(),
                    brief_id: brief.brief_id.clone(),
                    session_id: data.session_id.clone(),
                    amount_cents: data.amount_total,
                    tier: brief.tier,
                    customer_email: order.customer_email.clone(),
                    payment_intent_id: data.payment_intent_id.clone(),
                }),
            ))
            .await?;

        self.queue_order(order, &correlation).await
    }

    async fn queue_order(&self, order: Order, correlation: &str) -> GatewayResult<String> {
        let queued = order.transition_to(OrderStatus::Queued)?;
        self.orders.save(queued.clone()).await?;

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation,
                    AuditEventType::OrderStatusChanged,
                    "order",
                    queued.order_id.clone(),
                )
                .with_previous_state(serde_json::json!({
                    "status": order.status.to_string(),
                    "version": order.version,
                }))
                .with_new_state(serde_json::json!({
                    "status": queued.status.to_string(),
                    "version": queued.version,
                })),
            )
            .await?;

        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation,
                EventPayload::OrderQueued(OrderQueued {
                    order_id: queued.order_id.clone(),
                    brief_id: queued.brief_id.clone(),
                    tier: queued.tier,
                    customer_email: queued.customer_email.clone(),
                    delivery_days: self.price_book.delivery_days(queued.tier),
                }),
            ))
            .await?;

        tracing::info!(
            order_id = %queued.order_id,
            version = queued.version,
            "Order queued for production"
        );
        Ok(queued.order_id)
    }

    async fn handle_session_expired(
        &self,
        envelope: WebhookEnvelope,
    ) -> GatewayResult<WebhookOutcome> {
        let data: SessionExpiredData = serde_json::from_value(envelope.data)
            .map_err(|e| GatewayError::MalformedWebhook(e.to_string()))?;

        let correlation = match &data.metadata.brief_id {
            Some(brief_id) => self
                .briefs
                .get(brief_id)
                .await?
                .map(|b| b.correlation_id)
                .unwrap_or_else(|| data.session_id.clone()),
            None => data.session_id.clone(),
        };

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::CheckoutSessionExpired,
                    "checkout_session",
                    data.session_id.clone(),
                )
                .with_actor("payment-provider"),
            )
            .await?;

        // Cart recovery signal only. The cached brief stays so a fresh
        // session can be opened without re-assembly.
        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation,
                EventPayload::PaymentAbandoned(PaymentAbandoned {
                    session_id: data.session_id,
                    brief_id: data.metadata.brief_id,
                    customer_email: data.customer_email,
                }),
            ))
            .await?;

        Ok(WebhookOutcome::Processed { order_id: None })
    }

    async fn handle_payment_failed(
        &self,
        envelope: WebhookEnvelope,
    ) -> GatewayResult<WebhookOutcome> {
        let data: PaymentFailedData = serde_json::from_value(envelope.data)
            .map_err(|e| GatewayError::MalformedWebhook(e.to_string()))?;
        let reason = data
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payment declined".to_string());

        let correlation = match &data.metadata.brief_id {
            Some(brief_id) => self
                .briefs
                .get(brief_id)
                .await?
                .map(|b| b.correlation_id)
                .unwrap_or_else(|| data.session_id.clone()),
            None => data.session_id.clone(),
        };

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::PaymentFailed,
                    "payment",
                    data.session_id.clone(),
                )
                .with_metadata(serde_json::json!({"reason": reason}))
                .with_actor("payment-provider"),
            )
            .await?;

        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation,
                EventPayload::PaymentFailed(PaymentFailed {
                    session_id: data.session_id,
                    brief_id: data.metadata.brief_id,
                    reason,
                    customer_email: data.customer_email,
                }),
            ))
            .await?;

        Ok(WebhookOutcome::Processed { order_id: None })
    }

    async fn handle_charge_refunded(
        &self,
        envelope: WebhookEnvelope,
    ) -> GatewayResult<WebhookOutcome> {
        let data: ChargeRefundedData = serde_json::from_value(envelope.data)
            .map_err(|e| GatewayError::MalformedWebhook(e.to_string()))?;

        let Some(order) = self.orders.by_session_id(&data.session_id).await? else {
            tracing::warn!(
                session_id = %data.session_id,
                "Refund webhook for unknown session, ignoring"
            );
            return Ok(WebhookOutcome::Ignored {
                event_type: "charge.refunded".to_string(),
            });
        };

        if order.status == OrderStatus::Refunded {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        // Compensating transition, legal from any non-terminal state
        let refunded = order.transition_to(OrderStatus::Refunded)?;
        self.orders.save(refunded.clone()).await?;

        let correlation = self
            .briefs
            .get(&order.brief_id)
            .await?
            .map(|b| b.correlation_id)
            .unwrap_or_else(|| order.brief_id.clone());

        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::PaymentRefunded,
                    "payment",
                    data.session_id.clone(),
                )
                .with_metadata(serde_json::json!({
                    "amount_refunded": data.amount_refunded,
                    "reason": data.reason,
                }))
                .with_actor("payment-provider"),
            )
            .await?;
        self.audit_log
            .append(
                AuditEntry::new(
                    correlation.clone(),
                    AuditEventType::OrderStatusChanged,
                    "order",
                    refunded.order_id.clone(),
                )
                .with_previous_state(serde_json::json!({
                    "status": order.status.to_string(),
                    "version": order.version,
                }))
                .with_new_state(serde_json::json!({
                    "status": refunded.status.to_string(),
                    "version": refunded.version,
                })),
            )
            .await?;

        // Downstream listeners revoke delivery access off this event
        self.bus
            .publish(Event::new(
                COMPONENT,
                correlation,
                EventPayload::OrderRefunded(OrderRefunded {
                    order_id: refunded.order_id.clone(),
                    session_id: data.session_id,
                    amount_cents: data.amount_refunded,
                    reason: data.reason,
                }),
            ))
            .await?;

        tracing::info!(
            order_id = %refunded.order_id,
            previous_status = %order.status,
            "Order refunded"
        );
        Ok(WebhookOutcome::Processed {
            order_id: Some(refunded.order_id),
        })
    }

    async fn audit_duplicate(&self, brief_id: &str, session_id: &str) -> GatewayResult<()> {
        let correlation = self
            .briefs
            .get(brief_id)
            .await?
            .map(|b| b.correlation_id)
            .unwrap_or_else(|| session_id.to_string());
        self.audit_log
            .append(
                AuditEntry::new(
                    correlation,
                    AuditEventType::WebhookDuplicate,
                    "checkout_session",
                    session_id,
                )
                .with_actor("payment-provider"),
            )
            .await?;
        Ok(())
    }
}
