//! # Pipeline Orchestrator
//!
//! Assembles the payment gateway and delivery agent over a shared event bus,
//! installs their subscriptions, and serves the HTTP surface: webhook
//! ingestion, email-status callbacks, token exchange, health, and the
//! dead-letter admin endpoints.

pub mod config;
pub mod orchestrator;
pub mod routes;

pub use config::Config;
pub use orchestrator::{Pipeline, PipelineHealth};
pub use routes::{api_router, AppState, SIGNATURE_HEADER};
