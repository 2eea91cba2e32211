mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use base64::{engine::general_purpose, Engine as _};
use serial_test::serial;
use tower::ServiceExt;

#[tokio::test]
async fn test_health_reports_in_memory_backends() {
    let app = common::create_test_app();

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "peerinstruction-api");
    assert_eq!(json["dependencies"]["redis"]["status"], "healthy");
}

#[tokio::test]
async fn test_responses_carry_trace_id() {
    let app = common::create_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-trace-id", "trace-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers().get("x-trace-id").unwrap(), "trace-123");
    assert!(response
        .headers()
        .get("content-security-policy")
        .is_some());
}

#[tokio::test]
#[serial]
async fn test_metrics_require_basic_auth() {
    std::env::set_var("METRICS_AUTH", "scraper:secret");
    let app = common::create_test_app();

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let credentials = general_purpose::STANDARD.encode("scraper:secret");
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .header("authorization", format!("Basic {}", credentials))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));

    std::env::remove_var("METRICS_AUTH");
}
