//! Webhook router
//!
//! Dispatch table from provider event type to handler. Unrecognized types are
//! logged and acknowledged so the provider stops redelivering them; rejecting
//! them would only produce retry storms for events we never intend to handle.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GatewayResult;
use crate::models::{WebhookEnvelope, WebhookOutcome};

/// One registered webhook handler.
pub type WebhookHandler =
    Arc<dyn Fn(WebhookEnvelope) -> BoxFuture<'static, GatewayResult<WebhookOutcome>> + Send + Sync>;

#[derive(Default)]
pub struct WebhookRouter {
    routes: HashMap<String, WebhookHandler>,
}

impl WebhookRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a provider event type. Last registration wins.
    pub fn register(mut self, event_type: impl Into<String>, handler: WebhookHandler) -> Self {
        self.routes.insert(event_type.into(), handler);
        self
    }

    /// Route one verified webhook to its handler.
    pub async fn dispatch(&self, envelope: WebhookEnvelope) -> GatewayResult<WebhookOutcome> {
        match self.routes.get(&envelope.event_type) {
            Some(handler) => {
                tracing::debug!(
                    webhook_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Dispatching webhook"
                );
                handler(envelope).await
            }
            None => {
                tracing::info!(
                    webhook_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Unhandled webhook type, ignoring"
                );
                Ok(WebhookOutcome::Ignored {
                    event_type: envelope.event_type,
                })
            }
        }
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }
}
