//! HTTP surface tests. The router runs in-process over the in-memory store.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{memory_ledger, owner_id};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use utility_billing_service::startup::{router, AppState};
use utility_billing_service::store::MemoryStore;

fn test_router() -> (Router, MemoryStore) {
    let (ledger, store) = memory_ledger();
    let state = AppState {
        ledger: Arc::new(ledger),
    };
    (router(state), store)
}

fn statements_uri() -> String {
    format!("/v1/owners/{}/statements", owner_id())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn statement_body(date: &str, total_usage: i64, balance: &str, sub_meters: Value) -> Value {
    json!({
        "date": date,
        "total_usage": total_usage,
        "balance": balance,
        "status": "Pending",
        "sub_meters": sub_meters,
    })
}

#[tokio::test]
async fn create_returns_201_with_allocations() {
    let (app, _store) = test_router();

    let (status, _) = send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 800, "160.00", json!([{"label": "Kitchen", "reading": 50}]))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-02-15", 1000, "200.00", json!([{"label": "Kitchen", "reading": 120}]))),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "Pending");
    assert_eq!(body["version"], 1);
    assert_eq!(body["main_payment"]["amount"], "186.00");
    assert_eq!(body["sub_meters"][0]["label"], "Kitchen");
    assert_eq!(body["sub_meters"][0]["incremental_usage"], 70);
    assert_eq!(body["sub_meters"][0]["payment"]["amount"], "14.00");
}

#[tokio::test]
async fn malformed_input_is_422_and_rule_violation_is_400() {
    let (app, store) = test_router();

    let (status, body) = send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 0, "10.00", json!([]))),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Validation error");

    send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 800, "160.00", json!([{"label": "Kitchen", "reading": 50}]))),
    )
    .await;
    let (status, body) = send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-02-15", 1000, "200.00", json!([{"label": "Kitchen", "reading": 40}]))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid reading for sub meter \"Kitchen\"");
    assert_eq!(store.counts().await.statements, 1);
}

#[tokio::test]
async fn patch_get_and_delete_round_trip() {
    let (app, _store) = test_router();
    let (_, created) = send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 1000, "200.00", json!([]))),
    )
    .await;
    let uri = format!("{}/{}", statements_uri(), created["statement_id"].as_str().unwrap());

    let (status, updated) = send(
        &app,
        "PATCH",
        &uri,
        Some(json!({"status": "Paid", "expected_version": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "Paid");
    assert_eq!(updated["version"], 2);

    let (status, _) = send(
        &app,
        "PATCH",
        &uri,
        Some(json!({"status": "N/A", "expected_version": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, fetched) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, updated);

    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], false);

    let (status, _) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_and_summary_reflect_history() {
    let (app, _store) = test_router();
    send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 800, "80.00", json!([{"label": "Kitchen", "reading": 100}]))),
    )
    .await;
    send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-02-14", 1200, "600.00", json!([{"label": "Kitchen", "reading": 200}]))),
    )
    .await;

    let (status, page) = send(&app, "GET", &format!("{}?page_size=1", statements_uri()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["statements"].as_array().unwrap().len(), 1);
    assert_eq!(page["statements"][0]["period_date"], "2024-02-14");
    assert!(page["next_page_token"].is_string());

    let summary_uri = format!("/v1/owners/{}/summary", owner_id());
    let (status, summary) = send(&app, "GET", &summary_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["current"], "600.00");
    assert_eq!(summary["net_returns"], "7.35");

    let (status, _) = send(
        &app,
        "GET",
        &format!("{}?from=2024-03-01&to=2024-01-01", summary_uri),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn import_reports_each_item() {
    let (app, _store) = test_router();

    let (status, body) = send(
        &app,
        "POST",
        &format!("{}/import", statements_uri()),
        Some(json!({
            "statements": [
                statement_body("2024-02-15", 1000, "200.00", json!([{"label": "Kitchen", "reading": 120}])),
                statement_body("2024-01-15", 800, "160.00", json!([{"label": "Kitchen", "reading": 50}])),
            ]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "created");
    assert_eq!(body[0]["index"], 0);
    assert_eq!(body[1]["status"], "created");

    let (status, _) = send(
        &app,
        "POST",
        &format!("{}/import", statements_uri()),
        Some(json!({"statements": []})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let (app, _store) = test_router();

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "utility-billing-service");

    let (status, _) = send(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    send(
        &app,
        "POST",
        &statements_uri(),
        Some(statement_body("2024-01-15", 1000, "200.00", json!([]))),
    )
    .await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("utility_billing_statement_operations_total"));
}
