//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use payments_rs::signature::sign_payload;
use pipeline_rs::{api_router, AppState, Config, Pipeline, SIGNATURE_HEADER};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_http_test";

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        webhook_secret: WEBHOOK_SECRET.to_string(),
        delivery_token_secret: "dts_test".to_string(),
        url_signing_secret: "urls_test".to_string(),
        portal_base_url: "https://portal.example.com".to_string(),
        cdn_base_url: "https://cdn.example.com".to_string(),
        checkout_provider: "mock".to_string(),
        email_provider: "mock".to_string(),
        dead_letter_sweep_seconds: 60,
    }
}

async fn app() -> (Router, Pipeline) {
    let mut pipeline = Pipeline::assemble(&test_config()).unwrap();
    pipeline.start(Duration::from_secs(60)).await.unwrap();
    let router = api_router(AppState {
        bus: pipeline.bus.clone(),
        gateway: pipeline.gateway.clone(),
        agent: pipeline.agent.clone(),
        tracker: pipeline.tracker.clone(),
    });
    (router, pipeline)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn liveness_and_readiness_respond() {
    let (app, _pipeline) = app().await;

    let live = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = app
        .oneshot(
            Request::builder()
                .uri("/api/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    let body = body_json(ready).await;
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn webhook_without_signature_header_is_rejected() {
    let (app, _pipeline) = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/webhook")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let (app, _pipeline) = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/webhook")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, "t=1,v1=deadbeef")
                .body(Body::from(r#"{"id":"evt_1","type":"x","data":{}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signed_webhook_is_acknowledged() {
    let (app, _pipeline) = app().await;

    let body = serde_json::json!({
        "id": "evt_1",
        "type": "some.unhandled.type",
        "data": {}
    });
    let bytes = serde_json::to_vec(&body).unwrap();
    let header = sign_payload(&bytes, chrono::Utc::now().timestamp(), WEBHOOK_SECRET);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/payments/webhook")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, header)
                .body(Body::from(bytes))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["received"], true);
}

#[tokio::test]
async fn exchange_with_unknown_token_is_404() {
    let (app, _pipeline) = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/delivery/exchange")
                .header("content-type", "application/json")
                .header("x-forwarded-for", "203.0.113.9")
                .body(Body::from(r#"{"token":"nope"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn email_status_batch_reports_applied_count() {
    let (app, _pipeline) = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/delivery/events")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"[{"provider_message_id":"unknown","event":"delivered","email":"a@b.c"}]"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["applied"], 0);
}

#[tokio::test]
async fn dead_letter_admin_endpoints_respond() {
    let (app, _pipeline) = app().await;

    let list = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/dead-letters")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let body = body_json(list).await;
    assert_eq!(body["stats"]["pending"], 0);

    let retry = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/admin/dead-letters/retry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::OK);
    let body = body_json(retry).await;
    assert_eq!(body["republished"], 0);
}
