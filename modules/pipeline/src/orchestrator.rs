//! Pipeline assembly and lifecycle
//!
//! Builds the gateway and delivery agent over one in-memory bus, installs
//! their subscriptions, and runs the periodic dead-letter sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audit::{AuditLog, InMemoryAuditLog};
use delivery_rs::{
    AgentConfig, DeliveryAgent, EmailSender, HttpEmailSender, InMemoryAlertSink,
    InMemoryDownloadAuditLog, InMemoryNotificationStore, InMemoryTokenStore, MockEmailSender,
    NotificationTracker, SignedUrlGenerator, TokenMinter,
};
use event_bus::{
    DeadLetterStats, Event, EventBus, EventPayload, EventTopic, InMemoryBus, SubscriptionId,
};
use payments_rs::{
    CheckoutProvider, GatewayConfig, HttpCheckoutProvider, InMemoryBriefCache,
    InMemoryIdempotencyStore, InMemoryOrderStore, MockCheckoutProvider, PaymentGateway, PriceBook,
};
use serde::Serialize;

use crate::config::Config;

const GATEWAY_QUEUE: &str = "payment-gateway";
const DELIVERY_QUEUE: &str = "delivery-agent";

#[derive(Debug, Serialize)]
pub struct PipelineHealth {
    pub bus_connected: bool,
    pub dead_letters: DeadLetterStats,
}

impl PipelineHealth {
    pub fn is_ready(&self) -> bool {
        self.bus_connected
    }
}

/// Owns every subsystem of the order pipeline.
pub struct Pipeline {
    pub bus: Arc<InMemoryBus>,
    pub gateway: PaymentGateway,
    pub agent: DeliveryAgent,
    pub tracker: Arc<NotificationTracker>,
    pub audit_log: Arc<dyn AuditLog>,
    subscriptions: Vec<SubscriptionId>,
    sweep_task: Option<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Wire stores, providers, and subsystems from configuration. Nothing
    /// runs until [`start`](Self::start).
    pub fn assemble(config: &Config) -> anyhow::Result<Self> {
        let bus = Arc::new(InMemoryBus::new());
        let audit_log: Arc<dyn AuditLog> = Arc::new(InMemoryAuditLog::new());

        let provider: Arc<dyn CheckoutProvider> = match config.checkout_provider.as_str() {
            "http" => Arc::new(
                HttpCheckoutProvider::from_env().context("checkout provider configuration")?,
            ),
            _ => Arc::new(MockCheckoutProvider::new()),
        };
        let email: Arc<dyn EmailSender> = match config.email_provider.as_str() {
            "http" => {
                Arc::new(HttpEmailSender::from_env().context("email provider configuration")?)
            }
            _ => Arc::new(MockEmailSender::new()),
        };

        let gateway = PaymentGateway::new(
            bus.clone(),
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryBriefCache::new()),
            audit_log.clone(),
            provider,
            PriceBook::default(),
            GatewayConfig::new(&config.webhook_secret),
        );

        let notifications = Arc::new(InMemoryNotificationStore::new());
        let agent = DeliveryAgent::new(
            bus.clone(),
            Arc::new(InMemoryTokenStore::new()),
            notifications.clone(),
            Arc::new(InMemoryDownloadAuditLog::new()),
            audit_log.clone(),
            email,
            Arc::new(SignedUrlGenerator::new(
                &config.cdn_base_url,
                &config.url_signing_secret,
            )),
            TokenMinter::new(&config.delivery_token_secret),
            AgentConfig {
                portal_base_url: config.portal_base_url.clone(),
            },
        );

        let tracker = Arc::new(NotificationTracker::new(
            notifications,
            Arc::new(InMemoryAlertSink::new()),
            audit_log.clone(),
        ));

        Ok(Self {
            bus,
            gateway,
            agent,
            tracker,
            audit_log,
            subscriptions: Vec::new(),
            sweep_task: None,
        })
    }

    /// Connect the bus, install the consumer subscriptions, and spawn the
    /// dead-letter sweep.
    pub async fn start(&mut self, sweep_interval: Duration) -> anyhow::Result<()> {
        self.bus.connect().await?;

        let gateway = self.gateway.clone();
        let id = self
            .bus
            .subscribe(
                &[EventTopic::BriefReadyForPayment],
                Arc::new(move |event: Event| {
                    let gateway = gateway.clone();
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
                GATEWAY_QUEUE,
            )
            .await?;
        self.subscriptions.push(id);

        let agent = self.agent.clone();
        let id = self
            .bus
            .subscribe(
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
                    let agent = agent.clone();
                    Box::pin(async move {
                        agent
                            .handle_event(event)
                            .await
                            .map_err(|e| Box::new(e) as event_bus::HandlerError)
                    })
                }),
                DELIVERY_QUEUE,
            )
            .await?;
        self.subscriptions.push(id);

        let bus = self.bus.clone();
        self.sweep_task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match bus.sweep_dead_letters().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(republished = n, "Dead-letter sweep republished events"),
                    Err(e) => tracing::error!(error = %e, "Dead-letter sweep failed"),
                }
            }
        }));

        tracing::info!("Pipeline started");
        Ok(())
    }

    pub async fn health(&self) -> PipelineHealth {
        let stats = self.bus.dead_letters().stats().await.unwrap_or_default();
        PipelineHealth {
            bus_connected: self.bus.health_check().await,
            dead_letters: stats,
        }
    }

    /// Tear down subscriptions and the sweep task, then disconnect.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(&id).await?;
        }
        self.bus.disconnect().await?;
        tracing::info!("Pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            webhook_secret: "whsec_test".to_string(),
            delivery_token_secret: "dts_test".to_string(),
            url_signing_secret: "urls_test".to_string(),
            portal_base_url: "https://portal.example.com".to_string(),
            cdn_base_url: "https://cdn.example.com".to_string(),
            checkout_provider: "mock".to_string(),
            email_provider: "mock".to_string(),
            dead_letter_sweep_seconds: 60,
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trip() {
        let mut pipeline = Pipeline::assemble(&test_config()).unwrap();
        pipeline.start(Duration::from_secs(60)).await.unwrap();

        let health = pipeline.health().await;
        assert!(health.is_ready());
        assert_eq!(health.dead_letters.pending, 0);

        pipeline.shutdown().await.unwrap();
        assert!(!pipeline.bus.health_check().await);
    }
}
