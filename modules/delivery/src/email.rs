//! Transactional email sending
//!
//! The agent sends through the [`EmailSender`] trait: an HTTP implementation
//! for the hosted email provider and a mock that records outbound messages
//! for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use event_bus::PaymentTier;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::NotificationKind;

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },
}

impl EmailError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, EmailError::ApiError { status_code, .. } if (400..500).contains(status_code))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, EmailError::ApiError { status_code, .. } if (500..600).contains(status_code))
    }
}

// ============================================================================
// TEMPLATE BOOK
// ============================================================================

/// Maps a notification kind (and, for delivery, the tier) to a provider
/// template id.
#[derive(Debug, Clone)]
pub struct TemplateBook {
    templates: HashMap<NotificationKind, String>,
    enterprise_delivery: String,
}

impl Default for TemplateBook {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            NotificationKind::PaymentConfirmation,
            "tmpl-payment-confirmed".to_string(),
        );
        templates.insert(
            NotificationKind::PaymentFailure,
            "tmpl-payment-failed".to_string(),
        );
        templates.insert(
            NotificationKind::ProductionUpdate,
            "tmpl-production-update".to_string(),
        );
        templates.insert(
            NotificationKind::ProductionFailure,
            "tmpl-production-failed".to_string(),
        );
        templates.insert(
            NotificationKind::DeliveryReady,
            "tmpl-delivery-ready".to_string(),
        );
        Self {
            templates,
            enterprise_delivery: "tmpl-delivery-ready-enterprise".to_string(),
        }
    }
}

impl TemplateBook {
    pub fn template_id(&self, kind: NotificationKind, tier: PaymentTier) -> String {
        if kind == NotificationKind::DeliveryReady && tier == PaymentTier::Enterprise {
            return self.enterprise_delivery.clone();
        }
        self.templates
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| "tmpl-generic".to_string())
    }
}

// ============================================================================
// SENDER TRAIT
// ============================================================================

/// One outbound templated email.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub template_id: String,
    pub subject: String,
    /// Template substitution variables
    pub variables: serde_json::Value,
}

/// Seam to the email provider. Returns the provider's message id, which
/// later status webhooks reference.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<String, EmailError>;
}

// ============================================================================
// HTTP SENDER
// ============================================================================

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub base_url: String,
    pub from_address: String,
}

impl EmailConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, EmailError> {
        let api_key = std::env::var("EMAIL_API_KEY")
            .map_err(|_| EmailError::ConfigError("Missing EMAIL_API_KEY".to_string()))?;
        let base_url = std::env::var("EMAIL_API_URL")
            .unwrap_or_else(|_| "https://api.sendgrid.com".to_string());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS")
            .map_err(|_| EmailError::ConfigError("Missing EMAIL_FROM_ADDRESS".to_string()))?;

        Ok(Self {
            api_key,
            base_url,
            from_address,
        })
    }
}

/// Email sender over the provider's REST API.
#[derive(Clone)]
pub struct HttpEmailSender {
    config: Arc<EmailConfig>,
    http_client: Client,
}

impl HttpEmailSender {
    pub fn new(config: EmailConfig) -> Result<Self, EmailError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| EmailError::HttpError(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
        })
    }

    pub fn from_env() -> Result<Self, EmailError> {
        Self::new(EmailConfig::from_env()?)
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<String, EmailError> {
        let body = serde_json::json!({
            "personalizations": [{
                "to": [{ "email": message.to }],
                "dynamic_template_data": message.variables,
            }],
            "from": { "email": self.config.from_address },
            "subject": message.subject,
            "template_id": message.template_id,
        });

        let url = format!("{}/v3/mail/send", self.config.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EmailError::HttpError(e.to_string()))?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmailError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        // Provider should always return a message id on success; synthesize
        // one if the header is missing so tracking still functions.
        Ok(message_id.unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple())))
    }
}

// ============================================================================
// MOCK SENDER
// ============================================================================

/// Mock email sender for development and testing
///
/// - If the recipient address starts with `fail_`, sending fails
/// - Otherwise the message is recorded and a `msg_mock_` id returned
pub struct MockEmailSender {
    sent: Arc<Mutex<Vec<(String, EmailMessage)>>>,
}

impl MockEmailSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Messages recorded so far, with their assigned message ids.
    pub async fn sent(&self) -> Vec<(String, EmailMessage)> {
        self.sent.lock().await.clone()
    }
}

impl Default for MockEmailSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<String, EmailError> {
        if message.to.starts_with("fail_") {
            tracing::warn!(
                to = %message.to,
                "Mock email send failed (triggered by recipient address)"
            );
            return Err(EmailError::ApiError {
                status_code: 503,
                message: "provider unavailable".to_string(),
            });
        }

        let message_id = format!("msg_mock_{}", Uuid::new_v4().simple());
        tracing::info!(
            to = %message.to,
            template_id = %message.template_id,
            message_id = %message_id,
            "Mock email sent"
        );

        let mut sent = self.sent.lock().await;
        sent.push((message_id.clone(), message));
        Ok(message_id)
    }
}
