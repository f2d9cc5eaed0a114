//! Order versions climb by exactly one per transition, and terminal states
//! are final: a replayed confirmation after a refund changes nothing.

use std::sync::Arc;

use audit::{AuditEventType, AuditLog, InMemoryAuditLog};
use event_bus::{EventBus, InMemoryBus, PaymentTier};
use payments_rs::models::Brief;
use payments_rs::signature::sign_payload;
use payments_rs::{
    BriefCache, GatewayConfig, InMemoryBriefCache, InMemoryIdempotencyStore, InMemoryOrderStore,
    MockCheckoutProvider, OrderStatus, OrderStore, PaymentGateway, PriceBook, WebhookOutcome,
};

const WEBHOOK_SECRET: &str = "whsec_e2e";

struct World {
    gateway: PaymentGateway,
    orders: Arc<InMemoryOrderStore>,
    audit: Arc<InMemoryAuditLog>,
}

async fn world_with_brief(brief_id: &str) -> World {
    let bus = Arc::new(InMemoryBus::new());
    bus.connect().await.unwrap();
    let orders = Arc::new(InMemoryOrderStore::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let briefs = Arc::new(InMemoryBriefCache::new());
    briefs
        .put(Brief {
            brief_id: brief_id.to_string(),
            correlation_id: "corr-ver".to_string(),
            conversation_id: "conv-1".to_string(),
            business_name: "Acme Signage".to_string(),
            contact_email: "owner@acme.test".to_string(),
            tier: PaymentTier::Professional,
            quoted_amount_cents: 5000,
            video_duration_seconds: 30,
            confidence_score: None,
            received_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let gateway = PaymentGateway::new(
        bus,
        orders.clone(),
        Arc::new(InMemoryIdempotencyStore::new()),
        briefs,
        audit.clone(),
        Arc::new(MockCheckoutProvider::new()),
        PriceBook::default(),
        GatewayConfig::new(WEBHOOK_SECRET),
    );

    World {
        gateway,
        orders,
        audit,
    }
}

async fn deliver(world: &World, body: serde_json::Value) -> WebhookOutcome {
    let bytes = serde_json::to_vec(&body).unwrap();
    let header = sign_payload(&bytes, chrono::Utc::now().timestamp(), WEBHOOK_SECRET);
    let envelope = world.gateway.verify_and_parse(&bytes, &header).await.unwrap();
    world.gateway.process_webhook(envelope).await.unwrap()
}

fn completed(evt: &str, session: &str, brief: &str) -> serde_json::Value {
    serde_json::json!({
        "id": evt,
        "type": "checkout.session.completed",
        "data": {
            "session_id": session,
            "payment_intent_id": "pi_1",
            "amount_total": 5000,
            "customer_email": "owner@acme.test",
            "metadata": {"brief_id": brief}
        }
    })
}

fn refunded(evt: &str, session: &str) -> serde_json::Value {
    serde_json::json!({
        "id": evt,
        "type": "charge.refunded",
        "data": {
            "session_id": session,
            "amount_refunded": 5000,
            "reason": "requested_by_customer"
        }
    })
}

#[tokio::test]
async fn versions_climb_one_per_transition() {
    let world = world_with_brief("brief-ver").await;

    let outcome = deliver(&world, completed("evt_1", "cs_ver", "brief-ver")).await;
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    // Confirmation walked the order payment_confirmed -> queued
    let order = world
        .orders
        .by_brief_id("brief-ver")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Queued);
    assert_eq!(order.version, 2);
    assert_eq!(order.previous_status, Some(OrderStatus::PaymentConfirmed));

    let outcome = deliver(&world, refunded("evt_2", "cs_ver")).await;
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let order = world
        .orders
        .by_brief_id("brief-ver")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.version, 3);
    assert_eq!(order.previous_status, Some(OrderStatus::Queued));

    // Every recorded status change carries the version it produced
    let changes: Vec<_> = world
        .audit
        .by_correlation_id("corr-ver")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::OrderStatusChanged)
        .collect();
    assert_eq!(changes.len(), 2);
    for entry in &changes {
        assert!(entry.previous_state.is_some());
        assert!(entry.new_state.is_some());
    }
}

#[tokio::test]
async fn terminal_refund_blocks_later_replays() {
    let world = world_with_brief("brief-term").await;

    deliver(&world, completed("evt_1", "cs_term", "brief-term")).await;
    deliver(&world, refunded("evt_2", "cs_term")).await;

    // Replayed confirmation: the completion record answers, no state moves
    let outcome = deliver(&world, completed("evt_3", "cs_term", "brief-term")).await;
    assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);

    // Second refund is likewise acknowledged without effect
    let outcome = deliver(&world, refunded("evt_4", "cs_term")).await;
    assert_eq!(outcome, WebhookOutcome::AlreadyProcessed);

    let order = world
        .orders
        .by_brief_id("brief-term")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.version, 3, "replays never bump the version");
}
