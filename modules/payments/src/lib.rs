//! # Payment Gateway
//!
//! Converts finalized briefs into paid, queued orders.
//!
//! Flow: a `brief.ready_for_payment` event opens a hosted checkout session;
//! the provider later confirms payment with a signed webhook; the webhook is
//! ingested idempotently (per-session lock plus completion record), creates
//! the order, walks it `payment_confirmed -> queued`, and announces
//! `order.queued`. Expiry, failure, and refund webhooks are handled on the
//! same router.

pub mod checkout;
pub mod error;
pub mod gateway;
pub mod models;
pub mod order;
pub mod router;
pub mod signature;
pub mod stores;

pub use checkout::{
    CheckoutConfig, CheckoutProvider, HttpCheckoutProvider, MockCheckoutProvider, PriceBook,
    ProviderError,
};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{GatewayConfig, PaymentGateway};
pub use models::{Brief, CheckoutSession, WebhookEnvelope, WebhookOutcome};
pub use order::{Order, OrderStatus};
pub use router::{WebhookHandler, WebhookRouter};
pub use stores::{
    BriefCache, IdempotencyRecord, IdempotencyStore, InMemoryBriefCache, InMemoryIdempotencyStore,
    InMemoryOrderStore, OrderStore,
};
