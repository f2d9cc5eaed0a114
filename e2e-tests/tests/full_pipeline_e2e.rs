//! The whole pipeline, front to back: a finalized brief becomes a paid,
//! queued order; production completion becomes a portal link; the link
//! becomes a signed download URL. One correlation id ties it all together.

use std::sync::Arc;
use std::time::Duration;

use audit::{AuditEventType, AuditLog, InMemoryAuditLog};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use delivery_rs::{
    AgentConfig, DeliveryAgent, InMemoryAlertSink, InMemoryDownloadAuditLog,
    InMemoryNotificationStore, InMemoryTokenStore, MockEmailSender, NotificationTracker,
    SignedUrlGenerator, TokenMinter,
};
use event_bus::event::{BriefReadyForPayment, ProductionCompleted};
use event_bus::{Event, EventBus, EventPayload, EventTopic, InMemoryBus, PaymentTier};
use payments_rs::signature::sign_payload;
use payments_rs::{
    GatewayConfig, InMemoryBriefCache, InMemoryIdempotencyStore, InMemoryOrderStore,
    MockCheckoutProvider, OrderStatus, OrderStore, PaymentGateway, PriceBook,
};
use pipeline_rs::{api_router, AppState, SIGNATURE_HEADER};
use tokio::sync::Mutex;
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_full";
const CORRELATION: &str = "corr-full";

struct World {
    app: Router,
    bus: Arc<InMemoryBus>,
    orders: Arc<InMemoryOrderStore>,
    email: Arc<MockEmailSender>,
    audit: Arc<InMemoryAuditLog>,
}

async fn world() -> World {
    let bus = Arc::new(InMemoryBus::new());
    bus.connect().await.unwrap();

    let orders = Arc::new(InMemoryOrderStore::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let email = Arc::new(MockEmailSender::new());
    let notifications = Arc::new(InMemoryNotificationStore::new());

    let gateway = PaymentGateway::new(
        bus.clone(),
        orders.clone(),
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(InMemoryBriefCache::new()),
        audit.clone(),
        Arc::new(MockCheckoutProvider::new()),
        PriceBook::default(),
        GatewayConfig::new(WEBHOOK_SECRET),
    );

    let agent = DeliveryAgent::new(
        bus.clone(),
        Arc::new(InMemoryTokenStore::new()),
        notifications.clone(),
        Arc::new(InMemoryDownloadAuditLog::new()),
        audit.clone(),
        email.clone(),
        Arc::new(SignedUrlGenerator::new("https://cdn.example.com", "sig")),
        TokenMinter::new("tok"),
        AgentConfig {
            portal_base_url: "https://portal.example.com".to_string(),
        },
    );

    let tracker = Arc::new(NotificationTracker::new(
        notifications,
        Arc::new(InMemoryAlertSink::new()),
        audit.clone(),
    ));

    // Production wiring: gateway consumes briefs, the agent consumes the rest
    let consumer = gateway.clone();
    bus.subscribe(
        &[EventTopic::BriefReadyForPayment],
        Arc::new(move |event: Event| {
            let gateway = consumer.clone();
            Box::pin(async move {
                if let EventPayload::BriefReadyForPayment(payload) = event.payload {
                    gateway
                        .handle_brief_ready(payload, &event.correlation_id)
                        .await
                        .map_err(|e| Box::new(e) as event_bus::HandlerError)?;
                }
                Ok(())
            })
        }),
        "payment-gateway",
    )
    .await
    .unwrap();

    let consumer = agent.clone();
    bus.subscribe(
        &[
            EventTopic::PaymentConfirmed,
            EventTopic::PaymentFailed,
            EventTopic::ProductionStarted,
            EventTopic::ProductionPhaseComplete,
            EventTopic::ProductionCompleted,
            EventTopic::ProductionFailed,
            EventTopic::OrderRefunded,
        ],
        Arc::new(move |event: Event| {
            let agent = consumer.clone();
            Box::pin(async move {
                agent
                    .handle_event(event)
                    .await
                    .map_err(|e| Box::new(e) as event_bus::HandlerError)
            })
        }),
        "delivery-agent",
    )
    .await
    .unwrap();

    let app = api_router(AppState {
        bus: bus.clone(),
        gateway,
        agent,
        tracker,
    });

    World {
        app,
        bus,
        orders,
        email,
        audit,
    }
}

async fn collect(world: &World, topics: &[EventTopic]) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    world
        .bus
        .subscribe(
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

async fn wait_for(seen: &Arc<Mutex<Vec<Event>>>, topic: EventTopic) -> Event {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(event) = seen
                .lock()
                .await
                .iter()
                .find(|e| e.topic() == topic)
                .cloned()
            {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {topic} event in time"))
}

async fn post_json(app: &Router, uri: &str, headers: &[(&str, &str)], body: Vec<u8>) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn brief_to_download_under_one_correlation_id() {
    let world = world().await;
    let events = collect(
        &world,
        &[
            EventTopic::PaymentSessionCreated,
            EventTopic::OrderQueued,
            EventTopic::DeliveryCompleted,
        ],
    )
    .await;

    // 1. A finalized brief arrives
    world
        .bus
        .publish(Event::new(
            "brief-engine",
            CORRELATION,
            EventPayload::BriefReadyForPayment(BriefReadyForPayment {
                brief_id: "brief-full".to_string(),
                conversation_id: "conv-1".to_string(),
                business_name: "Acme Signage".to_string(),
                contact_email: "owner@acme.test".to_string(),
                tier: PaymentTier::Professional,
                quoted_amount_cents: 5000,
                video_duration_seconds: 30,
                confidence_score: Some(0.92),
            }),
        ))
        .await
        .unwrap();

    // 2. The gateway opens a checkout session
    let session_event = wait_for(&events, EventTopic::PaymentSessionCreated).await;
    assert_eq!(session_event.correlation_id, CORRELATION);
    let EventPayload::PaymentSessionCreated(session) = session_event.payload else {
        panic!("wrong payload");
    };

    // 3. The provider confirms payment over HTTP
    let body = serde_json::to_vec(&serde_json::json!({
        "id": "evt_full_1",
        "type": "checkout.session.completed",
        "data": {
            "session_id": session.session_id,
            "payment_intent_id": "pi_full",
            "amount_total": 5000,
            "customer_email": "owner@acme.test",
            "metadata": {"brief_id": "brief-full"}
        }
    }))
    .unwrap();
    let header = sign_payload(&body, chrono::Utc::now().timestamp(), WEBHOOK_SECRET);
    let (status, ack) = post_json(
        &world.app,
        "/api/payments/webhook",
        &[(SIGNATURE_HEADER, header.as_str())],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);

    // 4. The order lands in the production queue
    let queued = wait_for(&events, EventTopic::OrderQueued).await;
    assert_eq!(queued.correlation_id, CORRELATION);
    let EventPayload::OrderQueued(queued) = queued.payload else {
        panic!("wrong payload");
    };
    assert_eq!(queued.delivery_days, 3);

    let order = world
        .orders
        .by_brief_id("brief-full")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Queued);
    assert_eq!(order.order_id, queued.order_id);

    // 5. Production finishes; the agent mints the portal link
    world
        .bus
        .publish(Event::new(
            "production-engine",
            CORRELATION,
            EventPayload::ProductionCompleted(ProductionCompleted {
                order_id: queued.order_id.clone(),
                video_key: format!("videos/{}/final.mp4", queued.order_id),
                customer_email: "owner@acme.test".to_string(),
                tier: PaymentTier::Professional,
            }),
        ))
        .await
        .unwrap();

    let delivered = wait_for(&events, EventTopic::DeliveryCompleted).await;
    assert_eq!(delivered.correlation_id, CORRELATION);

    // 6. The customer follows the emailed link and exchanges the token
    let sent = world.email.sent().await;
    let (message_id, delivery_email) = sent
        .iter()
        .find(|(_, m)| m.template_id == "tmpl-delivery-ready")
        .expect("delivery email sent");
    let portal_url = delivery_email.variables["portal_url"].as_str().unwrap();
    let raw_token = portal_url.rsplit('/').next().unwrap();

    let (status, grant) = post_json(
        &world.app,
        "/api/delivery/exchange",
        &[("x-forwarded-for", "203.0.113.9")],
        serde_json::to_vec(&serde_json::json!({"token": raw_token})).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grant["order_id"], queued.order_id);
    let url = grant["download_url"].as_str().unwrap();
    assert!(url.starts_with("https://cdn.example.com/videos/"));
    assert!(url.contains("sig="));
    assert_eq!(grant["downloads_remaining"], 9);

    // 7. The email provider reports the delivery email as delivered
    let (status, applied) = post_json(
        &world.app,
        "/api/delivery/events",
        &[],
        serde_json::to_vec(&serde_json::json!([
            {"provider_message_id": message_id, "event": "delivered", "email": "owner@acme.test"}
        ]))
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["applied"], 1);

    // 8. The audit trail reconstructs the whole transaction
    let trail = world.audit.by_correlation_id(CORRELATION).await.unwrap();
    for expected in [
        AuditEventType::CheckoutSessionCreated,
        AuditEventType::PaymentConfirmed,
        AuditEventType::OrderCreated,
        AuditEventType::OrderStatusChanged,
        AuditEventType::DeliveryTokenIssued,
        AuditEventType::EmailSent,
        AuditEventType::DownloadSucceeded,
        AuditEventType::EmailStatusChanged,
    ] {
        assert!(
            trail.iter().any(|e| e.event_type == expected),
            "missing audit entry {expected:?}"
        );
    }
}
