//! Health check integration tests for utility-billing-service.
//!
//! Spawn the full application against PostgreSQL; run with
//! `cargo test -- --ignored`.

mod common;

use common::TestApp;
use reqwest::Client;
use serial_test::serial;

#[tokio::test]
#[ignore]
#[serial]
async fn health_check_works() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(&format!("{}/health", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "utility-billing-service");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(&format!("{}/ready", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn metrics_endpoint_works() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(&format!("{}/metrics", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or("").contains("text/plain"))
        .unwrap_or(false));

    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("utility_billing_"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn create_statement_over_http() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .post(&format!(
            "{}/v1/owners/{}/statements",
            app.http_address,
            common::TEST_OWNER_ID
        ))
        .json(&serde_json::json!({
            "date": "2024-01-15",
            "total_usage": 1000,
            "balance": "500.75",
            "status": "Pending",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["main_payment"]["amount"], "500.75");
    assert_eq!(body["pay_per_unit"], "0.50");

    app.cleanup().await;
}
