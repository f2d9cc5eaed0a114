//! # EventBus Abstraction
//!
//! A platform-level abstraction for event-driven messaging between the
//! pipeline components (payment gateway, delivery agent, production).
//!
//! ## Why This Lives in `platform/`
//!
//! The EventBus is a **shared runtime capability** that every module depends
//! on. Keeping it here allows:
//! - Modules to depend on platform crates without circular dependencies
//! - Plug-and-play module development (modules don't depend on each other)
//! - Swapping the transport behind the trait without touching any module
//!
//! ## Implementations
//!
//! - **InMemoryBus**: reference implementation with per-subscription queues,
//!   consumer retry, a publish-side circuit breaker, and dead-letter capture.
//!   A broker-backed implementation slots in behind the same trait.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{Event, EventBus, EventPayload, EventTopic, InMemoryBus, PaymentTier};
//! use event_bus::event::OrderQueued;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! bus.connect().await?;
//!
//! // Subscribe a handler to one or more topics
//! let sub_id = bus
//!     .subscribe(
//!         &[EventTopic::OrderQueued],
//!         Arc::new(|event| {
//!             Box::pin(async move {
//!                 tracing::info!(event_id = %event.event_id, "Order queued");
//!                 Ok(())
//!             })
//!         }),
//!         "production-worker",
//!     )
//!     .await?;
//!
//! // Publish a typed event
//! bus.publish(Event::new(
//!     "payment-gateway",
//!     "corr-123",
//!     EventPayload::OrderQueued(OrderQueued {
//!         order_id: "ORD-1A2B3C4D".to_string(),
//!         brief_id: "brief-9".to_string(),
//!         tier: PaymentTier::Starter,
//!         customer_email: "buyer@example.com".to_string(),
//!         delivery_days: 5,
//!     }),
//! ))
//! .await?;
//!
//! bus.unsubscribe(&sub_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod consumer_retry;
pub mod dead_letter;
pub mod event;
mod inmemory_bus;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use consumer_retry::{retry_with_backoff, RetryConfig};
pub use dead_letter::{
    DeadLetterRecord, DeadLetterStats, DeadLetterStatus, DeadLetterStore, InMemoryDeadLetterStore,
};
pub use event::{Event, EventPayload, EventPriority, EventTopic, PaymentTier};
pub use inmemory_bus::InMemoryBus;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish event: {0}")]
    PublishError(String),

    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("bus is not connected")]
    NotConnected,

    #[error("publish rejected, circuit breaker is open")]
    CircuitOpen,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Error type surfaced by subscriber handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An async subscriber callback. Each subscription owns one handler; the bus
/// invokes it once per delivered event and retries on failure.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Opaque handle identifying one active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Core event bus abstraction for typed publish-subscribe messaging.
///
/// Delivery guarantees are at-least-once per subscriber: a handler may see a
/// logical event more than once (redeliveries carry a fresh `event_id`), and
/// consumers are expected to be idempotent. Ordering is best-effort per topic;
/// nothing may depend on cross-topic ordering.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Establish the transport. Publishing before `connect` fails with
    /// [`BusError::NotConnected`].
    async fn connect(&self) -> BusResult<()>;

    /// Tear down the transport and stop all subscription workers.
    async fn disconnect(&self) -> BusResult<()>;

    /// Liveness of the underlying transport.
    async fn health_check(&self) -> bool;

    /// Publish an event to every subscription covering its topic.
    ///
    /// Fan-out is zero to many; publishing to a topic nobody subscribes to is
    /// not an error.
    async fn publish(&self, event: Event) -> BusResult<()>;

    /// Register a handler for a set of topics.
    ///
    /// # Arguments
    /// * `topics` - Topics routed to this subscription
    /// * `handler` - Callback invoked once per delivered event
    /// * `queue_name` - Stable name for logs and dead-letter records
    async fn subscribe(
        &self,
        topics: &[EventTopic],
        handler: EventHandler,
        queue_name: &str,
    ) -> BusResult<SubscriptionId>;

    /// Remove a subscription. Returns `false` if the id is unknown.
    async fn unsubscribe(&self, id: &SubscriptionId) -> BusResult<bool>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
