//! Integration tests for the health check endpoint and general HTTP behaviour.

mod common;

use axum::http::StatusCode;
use common::{body_json, get};

#[tokio::test]
async fn health_check_reports_memory_store() {
    let app = common::build_test_app();
    let response = get(&app.router, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["store"], "memory");
    assert!(json["version"].is_string());
    assert!(json.get("db_healthy").is_none());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = common::build_test_app();
    let response = get(&app.router, "/this-route-does-not-exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let app = common::build_test_app();
    let response = get(&app.router, "/health").await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Response must contain an x-request-id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn event_history_requires_postgres() {
    let app = common::build_test_app();
    let response = get(&app.router, "/api/v1/events?entity_type=task_run&entity_id=1").await;

    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "FAILED_PRECONDITION");
}
