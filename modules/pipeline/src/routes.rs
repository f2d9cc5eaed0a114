//! HTTP surface of the pipeline
//!
//! Webhook ingestion acknowledges fast: the signature is verified inline,
//! processing is spawned, and the provider gets its 200. Everything the
//! spawned task does is idempotent, so a crash before completion is repaired
//! by the provider's redelivery.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use delivery_rs::{DeliveryAgent, DeliveryError, DenialReason, EmailStatusUpdate, NotificationTracker};
use event_bus::{EventBus, InMemoryBus};
use payments_rs::{GatewayError, PaymentGateway};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

pub const SIGNATURE_HEADER: &str = "webhook-signature";

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<InMemoryBus>,
    pub gateway: PaymentGateway,
    pub agent: DeliveryAgent,
    pub tracker: Arc<NotificationTracker>,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/payments/webhook", post(payment_webhook))
        .route("/api/delivery/events", post(delivery_events))
        .route("/api/delivery/exchange", post(delivery_exchange))
        .route("/api/health/live", get(health_live))
        .route("/api/health/ready", get(health_ready))
        .route("/api/admin/dead-letters", get(dead_letters))
        .route("/api/admin/dead-letters/retry", post(dead_letters_retry))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "missing signature header"})),
            )
        })?;

    let envelope = state
        .gateway
        .verify_and_parse(&body, signature)
        .await
        .map_err(|e| {
            let status = match e {
                GatewayError::SignatureInvalid(_) => StatusCode::BAD_REQUEST,
                GatewayError::MalformedWebhook(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"error": e.to_string()})))
        })?;

    // Acknowledge before processing; the ingestion path is idempotent and
    // the provider redelivers anything it never saw complete.
    let gateway = state.gateway.clone();
    let webhook_id = envelope.id.clone();
    tokio::spawn(async move {
        match gateway.process_webhook(envelope).await {
            Ok(outcome) => {
                tracing::info!(webhook_id = %webhook_id, outcome = ?outcome, "Webhook processed")
            }
            Err(e) => {
                tracing::error!(webhook_id = %webhook_id, error = %e, "Webhook processing failed")
            }
        }
    });

    Ok(Json(json!({"received": true})))
}

async fn delivery_events(
    State(state): State<AppState>,
    Json(updates): Json<Vec<EmailStatusUpdate>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let applied = state
        .tracker
        .apply_status_batch(updates)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        })?;
    Ok(Json(json!({"applied": applied})))
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    token: String,
}

async fn delivery_exchange(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    match state.agent.exchange(&request.token, &ip, user_agent).await {
        Ok(grant) => Ok(Json(json!({
            "order_id": grant.order_id,
            "download_url": grant.download_url,
            "expires_at": grant.url_expires_at,
            "downloads_remaining": grant.downloads_remaining,
        }))),
        Err(DeliveryError::Denied { reason }) => {
            let status = match reason {
                DenialReason::NotFound => StatusCode::NOT_FOUND,
                DenialReason::Expired | DenialReason::Revoked => StatusCode::GONE,
                DenialReason::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            };
            Err((status, Json(json!({"error": reason.to_string()}))))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )),
    }
}

async fn health_live() -> StatusCode {
    StatusCode::OK
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.bus.health_check().await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let stats = state
        .bus
        .dead_letters()
        .stats()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "status": "ready",
        "bus": "connected",
        "dead_letters": stats,
    })))
}

async fn dead_letters(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let store = state.bus.dead_letters();
    let stats = store.stats().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let pending = store.pending().await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "stats": stats,
        "pending": pending,
    })))
}

async fn dead_letters_retry(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let republished = state
        .bus
        .sweep_dead_letters()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({"republished": republished})))
}
