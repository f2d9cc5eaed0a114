//! Download quota enforcement across the delivery agent: the k-th download
//! succeeds, the k+1-th is denied, and both outcomes leave audit evidence.

use std::sync::Arc;

use audit::{AuditEventType, AuditLog, InMemoryAuditLog};
use delivery_rs::{
    AgentConfig, DeliveryAgent, DenialReason, DownloadAuditLog, InMemoryDownloadAuditLog,
    InMemoryNotificationStore, InMemoryTokenStore, MockEmailSender, SignedUrlGenerator,
    TokenMinter,
};
use event_bus::event::ProductionCompleted;
use event_bus::{Event, EventBus, EventPayload, InMemoryBus, PaymentTier};

struct World {
    agent: DeliveryAgent,
    downloads: Arc<InMemoryDownloadAuditLog>,
    email: Arc<MockEmailSender>,
    audit: Arc<InMemoryAuditLog>,
}

async fn world() -> World {
    let bus = Arc::new(InMemoryBus::new());
    bus.connect().await.unwrap();
    let downloads = Arc::new(InMemoryDownloadAuditLog::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let email = Arc::new(MockEmailSender::new());

    let agent = DeliveryAgent::new(
        bus,
        Arc::new(InMemoryTokenStore::new()),
        Arc::new(InMemoryNotificationStore::new()),
        downloads.clone(),
        audit.clone(),
        email.clone(),
        Arc::new(SignedUrlGenerator::new("https://cdn.example.com", "sig")),
        TokenMinter::new("tok"),
        AgentConfig {
            portal_base_url: "https://portal.example.com".to_string(),
        },
    );

    World {
        agent,
        downloads,
        email,
        audit,
    }
}

async fn mint_for(world: &World, order_id: &str, tier: PaymentTier) -> String {
    world
        .agent
        .handle_event(Event::new(
            "production-engine",
            "corr-quota",
            EventPayload::ProductionCompleted(ProductionCompleted {
                order_id: order_id.to_string(),
                video_key: format!("videos/{order_id}/final.mp4"),
                customer_email: "owner@acme.test".to_string(),
                tier,
            }),
        ))
        .await
        .unwrap();

    let sent = world.email.sent().await;
    let (_, message) = sent.last().unwrap();
    message.variables["portal_url"]
        .as_str()
        .unwrap()
        .rsplit('/')
        .next()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn tenth_download_succeeds_eleventh_is_denied() {
    let world = world().await;
    let raw = mint_for(&world, "ORD-QUOTA001", PaymentTier::Starter).await;

    for i in 1..=10 {
        let grant = world
            .agent
            .exchange(&raw, "203.0.113.9", Some("it/1"))
            .await
            .unwrap();
        assert_eq!(grant.downloads_remaining, 10 - i);
    }

    let err = world
        .agent
        .exchange(&raw, "203.0.113.9", Some("it/1"))
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::QuotaExhausted));

    // Every attempt, including the denial, is in the download audit
    let attempts = world.downloads.for_order("ORD-QUOTA001").await.unwrap();
    assert_eq!(attempts.len(), 11);
    assert_eq!(attempts.iter().filter(|a| a.success).count(), 10);

    let entries = world.audit.by_correlation_id("corr-quota").await.unwrap();
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event_type == AuditEventType::DownloadSucceeded)
            .count(),
        10
    );
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event_type == AuditEventType::DownloadDenied)
            .count(),
        1
    );
}

#[tokio::test]
async fn enterprise_quota_is_fifty() {
    let world = world().await;
    let raw = mint_for(&world, "ORD-QUOTA002", PaymentTier::Enterprise).await;

    for _ in 0..50 {
        world
            .agent
            .exchange(&raw, "203.0.113.9", None)
            .await
            .unwrap();
    }
    let err = world
        .agent
        .exchange(&raw, "203.0.113.9", None)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::QuotaExhausted));
}

#[tokio::test]
async fn concurrent_exchanges_never_exceed_quota() {
    let world = world().await;
    let raw = mint_for(&world, "ORD-QUOTA003", PaymentTier::Starter).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let agent = world.agent.clone();
        let raw = raw.clone();
        tasks.push(tokio::spawn(async move {
            agent.exchange(&raw, "203.0.113.9", None).await.is_ok()
        }));
    }

    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 10, "quota must hold exactly under concurrency");
}
