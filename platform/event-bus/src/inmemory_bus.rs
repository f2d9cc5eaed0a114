//! In-memory implementation of the EventBus trait
//!
//! The reference transport: suitable for unit tests, local development, and
//! any single-process deployment. Each subscription owns an unbounded queue
//! and a worker task; a slow or failing subscriber never blocks publishers or
//! other subscribers.
//!
//! Delivery per subscription: invoke the handler, retry with backoff on
//! failure, and capture the event in the dead-letter store once retries are
//! exhausted. The worker then moves on, so a poison message cannot wedge the
//! queue.

use crate::circuit_breaker::CircuitBreaker;
use crate::consumer_retry::{retry_with_backoff, RetryConfig};
use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetterStore};
use crate::{
    BusError, BusResult, Event, EventBus, EventHandler, EventTopic, SubscriptionId,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

struct Subscription {
    topics: HashSet<EventTopic>,
    queue_name: String,
    sender: mpsc::UnboundedSender<Event>,
    worker: JoinHandle<()>,
}

/// EventBus implementation backed by in-process channels.
///
/// # Example
/// ```rust
/// use event_bus::{Event, EventBus, EventPayload, EventTopic, InMemoryBus, PaymentTier};
/// use event_bus::event::OrderQueued;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.connect().await?;
///
/// bus.subscribe(
///     &[EventTopic::OrderQueued],
///     Arc::new(|_event| Box::pin(async { Ok(()) })),
///     "production-worker",
/// )
/// .await?;
///
/// bus.publish(Event::new(
///     "payment-gateway",
///     "corr-1",
///     EventPayload::OrderQueued(OrderQueued {
///         order_id: "ORD-1A2B3C4D".into(),
///         brief_id: "brief-1".into(),
///         tier: PaymentTier::Starter,
///         customer_email: "buyer@example.com".into(),
///         delivery_days: 5,
///     }),
/// ))
/// .await?;
/// # Ok(())
/// # }
/// ```
pub struct InMemoryBus {
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
    connected: AtomicBool,
    breaker: Arc<CircuitBreaker>,
    retry_config: RetryConfig,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl InMemoryBus {
    /// Bus with default retry, breaker, and an in-memory dead-letter store.
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connected: AtomicBool::new(false),
            breaker: Arc::new(CircuitBreaker::default()),
            retry_config: RetryConfig::default(),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
        }
    }

    /// Override the per-subscription retry policy.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Override the publish-side circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Override the dead-letter store.
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    /// The dead-letter store this bus feeds.
    pub fn dead_letters(&self) -> Arc<dyn DeadLetterStore> {
        self.dead_letters.clone()
    }

    /// Republish every pending dead-letter record as a redelivery (fresh
    /// event id, same correlation id, bumped attempt count). Returns the
    /// number of events republished.
    ///
    /// Intended for operator triggers and periodic sweeps.
    pub async fn sweep_dead_letters(&self) -> BusResult<u32> {
        let pending = self.dead_letters.pending().await?;
        let mut republished = 0u32;

        for record in pending {
            let retry = record.event.retry_of();
            match self.publish(retry).await {
                Ok(()) => {
                    self.dead_letters.mark_republished(&record.record_id).await?;
                    republished += 1;
                }
                Err(e) => {
                    // Leave the record pending for the next sweep
                    tracing::warn!(
                        record_id = %record.record_id,
                        error = %e,
                        "Dead-letter republish failed, keeping record pending"
                    );
                }
            }
        }

        if republished > 0 {
            tracing::info!(count = republished, "Dead-letter sweep republished events");
        }
        Ok(republished)
    }

    fn spawn_worker(
        queue_name: String,
        handler: EventHandler,
        retry_config: RetryConfig,
        dead_letters: Arc<dyn DeadLetterStore>,
        mut receiver: mpsc::UnboundedReceiver<Event>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let span = tracing::info_span!(
                    "process_event",
                    event_id = %event.event_id,
                    correlation_id = %event.correlation_id,
                    topic = %event.topic(),
                    queue = %queue_name,
                );

                let handler = handler.clone();
                let deliver = async {
                    let result = retry_with_backoff(
                        || handler(event.clone()),
                        &retry_config,
                        &queue_name,
                    )
                    .await;

                    if let Err(e) = result {
                        if let Err(store_err) = dead_letters
                            .record_failure(&event, &queue_name, &e.to_string())
                            .await
                        {
                            tracing::error!(
                                event_id = %event.event_id,
                                error = %store_err,
                                "Failed to capture dead letter"
                            );
                        }
                    }
                };
                deliver.instrument(span).await;
            }
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn connect(&self) -> BusResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("In-memory bus connected");
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut subs = self.subscriptions.write().await;
        for (_, sub) in subs.drain() {
            drop(sub.sender);
            sub.worker.abort();
        }
        tracing::info!("In-memory bus disconnected");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, event: Event) -> BusResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        event.validate()?;
        self.breaker.check()?;

        let topic = event.topic();
        let subs = self.subscriptions.read().await;
        let mut send_failures = 0u32;
        let mut delivered = 0u32;

        for sub in subs.values() {
            if sub.topics.contains(&topic) {
                if sub.sender.send(event.clone()).is_err() {
                    send_failures += 1;
                    tracing::warn!(
                        queue = %sub.queue_name,
                        topic = %topic,
                        "Subscription queue closed, event not delivered"
                    );
                } else {
                    delivered += 1;
                }
            }
        }

        if send_failures > 0 {
            self.breaker.record_failure();
            return Err(BusError::PublishError(format!(
                "{send_failures} subscription queue(s) rejected the event"
            )));
        }
        self.breaker.record_success();

        tracing::debug!(
            event_id = %event.event_id,
            topic = %topic,
            subscribers = delivered,
            "Event published"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[EventTopic],
        handler: EventHandler,
        queue_name: &str,
    ) -> BusResult<SubscriptionId> {
        if topics.is_empty() {
            return Err(BusError::SubscribeError(
                "subscription needs at least one topic".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Self::spawn_worker(
            queue_name.to_string(),
            handler,
            self.retry_config.clone(),
            self.dead_letters.clone(),
            receiver,
        );

        let id = SubscriptionId::generate();
        self.subscriptions.write().await.insert(
            id,
            Subscription {
                topics: topics.iter().copied().collect(),
                queue_name: queue_name.to_string(),
                sender,
                worker,
            },
        );

        tracing::info!(
            subscription = %id,
            queue = %queue_name,
            topics = topics.len(),
            "Subscription registered"
        );
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> BusResult<bool> {
        let removed = self.subscriptions.write().await.remove(id);
        match removed {
            Some(sub) => {
                drop(sub.sender);
                sub.worker.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
