//! Checkout provider integration
//!
//! The gateway talks to the payment provider through the [`CheckoutProvider`]
//! trait: an HTTP implementation for production and a mock for development
//! and tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Brief, CheckoutSession};
use event_bus::PaymentTier;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl ProviderError {
    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProviderError::ApiError { status_code, .. } if (400..500).contains(status_code))
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(self, ProviderError::ApiError { status_code, .. } if (500..600).contains(status_code))
    }
}

// ============================================================================
// PRICE BOOK
// ============================================================================

/// Tier commercial policy: expected charge, delivery promise, and the
/// tolerance applied when reconciling a webhook amount.
#[derive(Debug, Clone)]
pub struct PriceBook {
    starter_cents: i64,
    professional_cents: i64,
    enterprise_cents: i64,
    /// Fractional tolerance for amount reconciliation
    tolerance: f64,
}

impl Default for PriceBook {
    fn default() -> Self {
        Self {
            starter_cents: 2_500,
            professional_cents: 5_000,
            enterprise_cents: 15_000,
            tolerance: 0.01,
        }
    }
}

impl PriceBook {
    pub fn expected_amount(&self, tier: PaymentTier) -> i64 {
        match tier {
            PaymentTier::Starter => self.starter_cents,
            PaymentTier::Professional => self.professional_cents,
            PaymentTier::Enterprise => self.enterprise_cents,
        }
    }

    /// Delivery promise in days per tier.
    pub fn delivery_days(&self, tier: PaymentTier) -> u32 {
        match tier {
            PaymentTier::Starter => 5,
            PaymentTier::Professional => 3,
            PaymentTier::Enterprise => 2,
        }
    }

    /// Whether a charged amount reconciles with the tier within tolerance.
    /// Callers log a mismatch and continue; the money already moved.
    pub fn amount_matches(&self, tier: PaymentTier, amount_cents: i64) -> bool {
        let expected = self.expected_amount(tier) as f64;
        let delta = (amount_cents as f64 - expected).abs();
        delta <= expected * self.tolerance
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Seam to the hosted-checkout provider.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    /// Create a hosted checkout session for a brief. The brief id travels in
    /// session metadata and comes back on every webhook for that session.
    async fn create_session(&self, brief: &Brief) -> Result<CheckoutSession, ProviderError>;
}

// ============================================================================
// HTTP PROVIDER
// ============================================================================

/// Configuration for the HTTP checkout provider
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub secret_key: String,
    pub base_url: String,
    pub success_url: String,
    pub cancel_url: String,
    /// How long a hosted session stays payable
    pub session_ttl_minutes: i64,
}

impl CheckoutConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ProviderError> {
        let secret_key = std::env::var("CHECKOUT_SECRET_KEY")
            .map_err(|_| ProviderError::ConfigError("Missing CHECKOUT_SECRET_KEY".to_string()))?;
        let base_url = std::env::var("CHECKOUT_API_URL")
            .unwrap_or_else(|_| "https://api.checkout.example.com".to_string());
        let success_url = std::env::var("CHECKOUT_SUCCESS_URL")
            .map_err(|_| ProviderError::ConfigError("Missing CHECKOUT_SUCCESS_URL".to_string()))?;
        let cancel_url = std::env::var("CHECKOUT_CANCEL_URL")
            .map_err(|_| ProviderError::ConfigError("Missing CHECKOUT_CANCEL_URL".to_string()))?;
        let session_ttl_minutes = std::env::var("CHECKOUT_SESSION_TTL_MINUTES")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<i64>()
            .unwrap_or(30);

        Ok(Self {
            secret_key,
            base_url,
            success_url,
            cancel_url,
            session_ttl_minutes,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: String,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// Checkout provider over the provider's REST API.
#[derive(Clone)]
pub struct HttpCheckoutProvider {
    config: Arc<CheckoutConfig>,
    http_client: Client,
    price_book: PriceBook,
}

impl HttpCheckoutProvider {
    pub fn new(config: CheckoutConfig, price_book: PriceBook) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
            price_book,
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(CheckoutConfig::from_env()?, PriceBook::default())
    }
}

#[async_trait]
impl CheckoutProvider for HttpCheckoutProvider {
    async fn create_session(&self, brief: &Brief) -> Result<CheckoutSession, ProviderError> {
        let amount_cents = self.price_book.expected_amount(brief.tier);
        let body = serde_json::json!({
            "amount": amount_cents,
            "currency": "usd",
            "customer_email": brief.contact_email,
            "success_url": self.config.success_url,
            "cancel_url": self.config.cancel_url,
            "expires_in_minutes": self.config.session_ttl_minutes,
            "metadata": { "brief_id": brief.brief_id },
        });

        let url = format!("{}/v1/checkout/sessions", self.config.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.secret_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        tracing::info!(
            brief_id = %brief.brief_id,
            session_id = %session.id,
            amount_cents = amount_cents,
            "Checkout session created"
        );

        Ok(CheckoutSession {
            session_id: session.id,
            checkout_url: session.url,
            amount_cents,
            currency: "usd".to_string(),
            expires_at: session
                .expires_at
                .unwrap_or_else(|| Utc::now() + Duration::minutes(self.config.session_ttl_minutes)),
        })
    }
}

// ============================================================================
// MOCK PROVIDER
// ============================================================================

/// Mock checkout provider for development and testing
///
/// - If the brief's business name starts with `fail_`, session creation fails
/// - Otherwise a session with a `cs_mock_` id is returned
pub struct MockCheckoutProvider {
    price_book: PriceBook,
    session_ttl_minutes: i64,
}

impl MockCheckoutProvider {
    pub fn new() -> Self {
        Self {
            price_book: PriceBook::default(),
            session_ttl_minutes: 30,
        }
    }
}

impl Default for MockCheckoutProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckoutProvider for MockCheckoutProvider {
    async fn create_session(&self, brief: &Brief) -> Result<CheckoutSession, ProviderError> {
        if brief.business_name.starts_with("fail_") {
            tracing::warn!(
                brief_id = %brief.brief_id,
                "Mock session creation failed (triggered by business name)"
            );
            return Err(ProviderError::ApiError {
                status_code: 502,
                message: "provider unavailable".to_string(),
            });
        }

        let session_id = format!("cs_mock_{}", Uuid::new_v4().simple());
        tracing::info!(
            brief_id = %brief.brief_id,
            session_id = %session_id,
            "Mock checkout session created"
        );

        Ok(CheckoutSession {
            checkout_url: format!("https://checkout.example.com/pay/{session_id}"),
            session_id,
            amount_cents: self.price_book.expected_amount(brief.tier),
            currency: "usd".to_string(),
            expires_at: Utc::now() + Duration::minutes(self.session_ttl_minutes),
        })
    }
}
