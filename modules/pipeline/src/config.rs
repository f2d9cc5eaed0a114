use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Shared secret the payment provider signs webhook bodies with
    pub webhook_secret: String,
    /// Server secret for hashing delivery tokens
    pub delivery_token_secret: String,
    /// Server secret for signing short-lived download URLs
    pub url_signing_secret: String,

    pub portal_base_url: String,
    pub cdn_base_url: String,

    /// "mock" or "http"
    pub checkout_provider: String,
    /// "mock" or "http"
    pub email_provider: String,

    pub dead_letter_sweep_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8088".to_string())
                .parse()?,

            webhook_secret: env::var("WEBHOOK_SECRET")?,
            delivery_token_secret: env::var("DELIVERY_TOKEN_SECRET")?,
            url_signing_secret: env::var("URL_SIGNING_SECRET")?,

            portal_base_url: env::var("PORTAL_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8088/portal".to_string()),
            cdn_base_url: env::var("CDN_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8088/assets".to_string()),

            checkout_provider: env::var("CHECKOUT_PROVIDER")
                .unwrap_or_else(|_| "mock".to_string()),
            email_provider: env::var("EMAIL_PROVIDER").unwrap_or_else(|_| "mock".to_string()),

            dead_letter_sweep_seconds: env::var("DEAD_LETTER_SWEEP_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
        })
    }
}
