//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use secspot_agent::api::{create_router, AppState};
use secspot_lib::{
    config::TransportSettings,
    health::{components, HealthRegistry},
    observability::AgentMetrics,
    proto::HostInfo,
    CollectorKind, TransportClient,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::TRANSPORT).await;
    health_registry.register(components::PIPELINE).await;
    health_registry
        .register(&components::collector(CollectorKind::Security))
        .await;

    let host = HostInfo {
        hostname: "api-test".into(),
        platform: "linux".into(),
        platform_version: "6.1".into(),
    };
    let transport = Arc::new(TransportClient::websocket(TransportSettings::default(), host));

    let metrics = AgentMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics, transport));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, axum::body::Bytes) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["transport"].is_object());
    assert!(health["components"]["collector.security"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    // A timed-out collector degrades but does not fail the agent
    state
        .health_registry
        .set_degraded(
            &components::collector(CollectorKind::Security),
            "collect timed out",
        )
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["collector.security"]["message"],
        "collect timed out"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::PIPELINE, "pipeline stopped")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state) = setup_test_app().await;

    // By default, agent is not ready
    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;
    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::TRANSPORT, "handshake rejected")
        .await;

    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state
        .metrics
        .observe_collection_latency(CollectorKind::System, 0.004);
    state.metrics.inc_samples_collected(CollectorKind::System);
    state.metrics.inc_entries_dropped("sample");
    state.metrics.set_outbound_buffer(12);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("secspot_collection_latency_seconds_bucket"));
    assert!(metrics_text.contains("secspot_samples_collected_total"));
    assert!(metrics_text.contains("secspot_entries_dropped_total"));
    assert!(metrics_text.contains("secspot_outbound_buffer_entries"));
}

#[tokio::test]
async fn test_status_reports_disconnected_transport() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);

    let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["state"]["state"], "disconnected");
    assert!(report["connection"].is_null());
    assert_eq!(report["queued"], 0);
    assert!(report["history"].as_array().unwrap().is_empty());
}
