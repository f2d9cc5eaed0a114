//! End-to-end gateway tests over the in-memory bus and mock provider.

use std::sync::Arc;
use std::time::Duration;

use audit::{AuditEventType, AuditLog, InMemoryAuditLog};
use event_bus::event::BriefReadyForPayment;
use event_bus::{Event, EventBus, EventTopic, InMemoryBus, PaymentTier};
use payments_rs::signature::sign_payload;
use payments_rs::{
    GatewayConfig, GatewayError, InMemoryBriefCache, InMemoryIdempotencyStore, InMemoryOrderStore,
    MockCheckoutProvider, OrderStatus, OrderStore, PaymentGateway, PriceBook, WebhookOutcome,
};
use tokio::sync::Mutex;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

struct Harness {
    bus: Arc<InMemoryBus>,
    gateway: PaymentGateway,
    orders: Arc<InMemoryOrderStore>,
    audit: Arc<InMemoryAuditLog>,
}

async fn harness() -> Harness {
    let bus = Arc::new(InMemoryBus::new());
    bus.connect().await.unwrap();

    let orders = Arc::new(InMemoryOrderStore::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let gateway = PaymentGateway::new(
        bus.clone(),
        orders.clone(),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(InMemoryBriefCache::new()),
        audit.clone(),
        Arc::new(MockCheckoutProvider::new()),
        PriceBook::default(),
        GatewayConfig {
            lock_wait: Duration::from_millis(500),
            lock_poll_interval: Duration::from_millis(10),
            ..GatewayConfig::new(WEBHOOK_SECRET)
        },
    );

    Harness {
        bus,
        gateway,
        orders,
        audit,
    }
}

fn brief_payload(brief_id: &str) -> BriefReadyForPayment {
    BriefReadyForPayment {
        brief_id: brief_id.to_string(),
        conversation_id: "conv-1".to_string(),
        business_name: "Acme Signage".to_string(),
        contact_email: "owner@acme.test".to_string(),
        tier: PaymentTier::Starter,
        quoted_amount_cents: 2500,
        video_duration_seconds: 30,
        confidence_score: Some(0.9),
    }
}

fn signed(body: serde_json::Value) -> (Vec<u8>, String) {
    let bytes = serde_json::to_vec(&body).unwrap();
    let header = sign_payload(&bytes, chrono::Utc::now().timestamp(), WEBHOOK_SECRET);
    (bytes, header)
}

fn completed_webhook(session_id: &str, brief_id: &str, amount: i64) -> (Vec<u8>, String) {
    signed(serde_json::json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": "checkout.session.completed",
        "data": {
            "session_id": session_id,
            "payment_intent_id": "pi_1",
            "amount_total": amount,
            "customer_email": "owner@acme.test",
            "metadata": {"brief_id": brief_id}
        }
    }))
}

async fn subscribe_collector(
    bus: &Arc<InMemoryBus>,
    topics: &[EventTopic],
) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    bus.subscribe(
        topics,
        Arc::new(move |event| {
            let seen = seen_in.clone();
            Box::pin(async move {
                seen.lock().await.push(event);
                Ok(())
            })
        }),
        "test-collector",
    )
    .await
    .unwrap();
    seen
}

async fn wait_for<F: Fn(usize) -> bool>(seen: &Arc<Mutex<Vec<Event>>>, pred: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pred(seen.lock().await.len()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for published events");
}

#[tokio::test]
async fn confirmed_webhook_creates_and_queues_order() {
    let h = harness().await;
    let published = subscribe_collector(
        &h.bus,
        &[EventTopic::PaymentConfirmed, EventTopic::OrderQueued],
    )
    .await;

    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-1"), "corr-1")
        .await
        .unwrap();

    let (body, header) = completed_webhook(&session.session_id, "brief-1", 2500);
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();

    let WebhookOutcome::Processed {
        order_id: Some(order_id),
    } = outcome
    else {
        panic!("expected Processed, got {outcome:?}");
    };

    let order = h.orders.get(&order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Queued);
    assert_eq!(order.previous_status, Some(OrderStatus::PaymentConfirmed));
    assert_eq!(order.version, 2);

    wait_for(&published, |n| n >= 2).await;
    let events = published.lock().await;
    assert!(events
        .iter()
        .all(|e| e.correlation_id == "corr-1"));

    // Audit trail: payment confirmation strictly before order creation
    let trail = h.audit.by_correlation_id("corr-1").await.unwrap();
    let types: Vec<_> = trail.iter().map(|e| e.event_type).collect();
    let confirmed_at = types
        .iter()
        .position(|t| *t == AuditEventType::PaymentConfirmed)
        .unwrap();
    let created_at = types
        .iter()
        .position(|t| *t == AuditEventType::OrderCreated)
        .unwrap();
    assert!(confirmed_at < created_at);
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == AuditEventType::OrderCreated)
            .count(),
        1
    );
}

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let h = harness().await;
    h.gateway
        .handle_brief_ready(brief_payload("brief-2"), "corr-2")
        .await
        .unwrap();

    let (body, _) = completed_webhook("cs_forged", "brief-2", 2500);
    let header = format!("t={},v1={}", chrono::Utc::now().timestamp(), "00".repeat(32));

    let err = h.gateway.verify_and_parse(&body, &header).await.unwrap_err();
    assert!(matches!(err, GatewayError::SignatureInvalid(_)));

    assert!(h.orders.by_session_id("cs_forged").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_once() {
    let h = harness().await;
    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-3"), "corr-3")
        .await
        .unwrap();

    let (body, header) = completed_webhook(&session.session_id, "brief-3", 2500);
    let first = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome1 = h.gateway.process_webhook(first).await.unwrap();
    assert!(matches!(outcome1, WebhookOutcome::Processed { .. }));

    // Provider redelivers the identical payload
    let second = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome2 = h.gateway.process_webhook(second).await.unwrap();
    assert_eq!(outcome2, WebhookOutcome::AlreadyProcessed);

    let order = h
        .orders
        .by_brief_id("brief-3")
        .await
        .unwrap()
        .expect("order exists");
    assert_eq!(order.version, 2, "duplicate must not advance the order");

    let dup_entries = h.audit.by_correlation_id("corr-3").await.unwrap();
    assert_eq!(
        dup_entries
            .iter()
            .filter(|e| e.event_type == AuditEventType::WebhookDuplicate)
            .count(),
        1
    );
}

#[tokio::test]
async fn concurrent_deliveries_process_exactly_once() {
    let h = harness().await;
    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-4"), "corr-4")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let gateway = h.gateway.clone();
        let (body, header) = completed_webhook(&session.session_id, "brief-4", 2500);
        tasks.push(tokio::spawn(async move {
            let envelope = gateway.verify_and_parse(&body, &header).await.unwrap();
            gateway.process_webhook(envelope).await.unwrap()
        }));
    }

    let mut processed = 0;
    for task in tasks {
        match task.await.unwrap() {
            WebhookOutcome::Processed { .. } => processed += 1,
            WebhookOutcome::AlreadyProcessed | WebhookOutcome::ProcessingElsewhere => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(processed, 1, "exactly one delivery does the work");

    let order = h.orders.by_brief_id("brief-4").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Queued);
    assert_eq!(order.version, 2);
}

#[tokio::test]
async fn amount_mismatch_warns_but_fulfils() {
    let h = harness().await;
    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-5"), "corr-5")
        .await
        .unwrap();

    // Charged 10% over the starter price
    let (body, header) = completed_webhook(&session.session_id, "brief-5", 2750);
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();

    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    let order = h.orders.by_brief_id("brief-5").await.unwrap().unwrap();
    assert_eq!(order.amount_cents, 2750);
    assert_eq!(order.status, OrderStatus::Queued);
}

#[tokio::test]
async fn expired_session_publishes_abandonment_only() {
    let h = harness().await;
    let abandoned = subscribe_collector(&h.bus, &[EventTopic::PaymentAbandoned]).await;
    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-6"), "corr-6")
        .await
        .unwrap();

    let (body, header) = signed(serde_json::json!({
        "id": "evt_exp",
        "type": "checkout.session.expired",
        "data": {
            "session_id": session.session_id,
            "customer_email": "owner@acme.test",
            "metadata": {"brief_id": "brief-6"}
        }
    }));
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed { order_id: None });
    wait_for(&abandoned, |n| n >= 1).await;
    assert!(h.orders.by_brief_id("brief-6").await.unwrap().is_none());
}

#[tokio::test]
async fn refund_compensates_queued_order() {
    let h = harness().await;
    let refund_events = subscribe_collector(&h.bus, &[EventTopic::OrderRefunded]).await;
    let session = h
        .gateway
        .handle_brief_ready(brief_payload("brief-7"), "corr-7")
        .await
        .unwrap();

    let (body, header) = completed_webhook(&session.session_id, "brief-7", 2500);
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    h.gateway.process_webhook(envelope).await.unwrap();

    let (body, header) = signed(serde_json::json!({
        "id": "evt_ref",
        "type": "charge.refunded",
        "data": {
            "session_id": session.session_id,
            "payment_intent_id": "pi_1",
            "amount_refunded": 2500,
            "reason": "requested_by_customer"
        }
    }));
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

    let order = h.orders.by_brief_id("brief-7").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.previous_status, Some(OrderStatus::Queued));
    assert_eq!(order.version, 3);

    wait_for(&refund_events, |n| n >= 1).await;

    // A second refund delivery is a duplicate
    let (body, header) = signed(serde_json::json!({
        "id": "evt_ref2",
        "type": "charge.refunded",
        "data": {
            "session_id": session.session_id,
            "amount_refunded": 2500
        }
    }));
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    assert_eq!(
        h.gateway.process_webhook(envelope).await.unwrap(),
        WebhookOutcome::AlreadyProcessed
    );
}

#[tokio::test]
async fn unknown_event_type_is_ignored() {
    let h = harness().await;
    let (body, header) = signed(serde_json::json!({
        "id": "evt_misc",
        "type": "customer.updated",
        "data": {"anything": true}
    }));
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            event_type: "customer.updated".to_string()
        }
    );
}

#[tokio::test]
async fn failed_processing_leaves_key_open_for_redelivery() {
    let h = harness().await;

    // Webhook for a brief nobody cached: processing fails, nothing marked done
    let (body, header) = completed_webhook("cs_orphan", "brief-missing", 2500);
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let err = h.gateway.process_webhook(envelope).await.unwrap_err();
    assert!(matches!(err, GatewayError::BriefNotFound(_)));

    // The brief shows up (late consumer), then a redelivery succeeds
    h.gateway
        .handle_brief_ready(brief_payload("brief-missing"), "corr-late")
        .await
        .unwrap();

    let (body, header) = completed_webhook("cs_orphan", "brief-missing", 2500);
    let envelope = h.gateway.verify_and_parse(&body, &header).await.unwrap();
    let outcome = h.gateway.process_webhook(envelope).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
}
