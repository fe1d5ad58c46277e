use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use reservo_api::app::{AppServices, build_app};
use reservo_infra::vendor::{ScriptedOutcomes, SimulatedVendor, VendorError, VendorOutcome};
use reservo_infra::{InMemoryBookingStore, InMemoryJobStore, Pipeline, PipelineConfig, PipelineHandle};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _pipeline: PipelineHandle,
}

impl TestServer {
    /// Same router as prod on an ephemeral port, with in-memory stores and a
    /// vendor that plays back `outcomes` without latency.
    async fn spawn(outcomes: ScriptedOutcomes) -> Self {
        let mut config = PipelineConfig::default();
        config.retry.max_attempts = 3;
        config.retry.base_delay = Duration::ZERO;
        config.retry.max_delay = Duration::ZERO;
        config.worker.poll_interval = Duration::from_millis(1);

        let pipeline = Pipeline::new(
            config,
            Arc::new(InMemoryBookingStore::new()),
            InMemoryJobStore::arc(),
            Arc::new(SimulatedVendor::new(outcomes)),
        );
        let services = AppServices::new(pipeline);
        let pipeline_handle = services.start();
        let app = build_app(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _pipeline: pipeline_handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn booking_body() -> serde_json::Value {
    json!({
        "guestName": "Ada Lovelace",
        "guestEmail": "ada@example.com",
        "checkIn": "2026-03-01",
        "checkOut": "2026-03-04",
        "roomType": "deluxe"
    })
}

async fn create(client: &reqwest::Client, base_url: &str, key: &str) -> reqwest::Response {
    client
        .post(format!("{}/bookings", base_url))
        .header("X-Idempotency-Key", key)
        .json(&booking_body())
        .send()
        .await
        .unwrap()
}

async fn get_booking_eventually(
    client: &reqwest::Client,
    base_url: &str,
    id: i64,
) -> serde_json::Value {
    // Fulfillment is asynchronous: poll until the booking leaves `pending`.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/bookings/{}", base_url, id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if body["data"]["status"] != "pending" {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("booking did not reach a terminal state within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn booking_is_created_pending_then_confirmed() {
    let srv = TestServer::spawn(ScriptedOutcomes::failing_times(1, VendorError::Timeout)).await;
    let client = reqwest::Client::new();

    let res = create(&client, &srv.base_url, "k1").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    let data = &body["data"];
    assert_eq!(data["status"], "pending");
    assert_eq!(data["idempotencyKey"], "k1");
    assert_eq!(data["guestName"], "Ada Lovelace");
    assert_eq!(data["checkIn"], "2026-03-01");
    assert_eq!(data["retryCount"], 0);
    assert!(data["vendorBookingId"].is_null());

    let id = data["id"].as_i64().unwrap();
    let body = get_booking_eventually(&client, &srv.base_url, id).await;
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["retryCount"], 1);
    assert!(
        body["data"]["vendorBookingId"]
            .as_str()
            .unwrap()
            .starts_with("VENDOR-")
    );
    assert!(body["data"]["failureReason"].is_null());
}

#[tokio::test]
async fn exhausted_booking_reads_back_failed() {
    let srv = TestServer::spawn(ScriptedOutcomes::always(VendorOutcome::Fail(
        VendorError::Rejected,
    )))
    .await;
    let client = reqwest::Client::new();

    let res = create(&client, &srv.base_url, "k1").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    let id = body["data"]["id"].as_i64().unwrap();

    let body = get_booking_eventually(&client, &srv.base_url, id).await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["retryCount"], 3);
    assert_eq!(body["data"]["failureReason"], "Booking rejected by vendor");
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/bookings", srv.base_url))
        .json(&booking_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    // Nothing was stored.
    let res = client
        .get(format!("{}/bookings", srv.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["meta"]["total"], 0);
}

#[tokio::test]
async fn reused_idempotency_key_conflicts() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;
    let client = reqwest::Client::new();

    assert_eq!(create(&client, &srv.base_url, "dup").await.status(), StatusCode::CREATED);

    let res = create(&client, &srv.base_url, "dup").await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn invalid_bodies_are_rejected() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;
    let client = reqwest::Client::new();

    let mut reversed = booking_body();
    reversed["checkIn"] = json!("2026-03-04");
    reversed["checkOut"] = json!("2026-03-01");

    let mut bad_email = booking_body();
    bad_email["guestEmail"] = json!("not-an-email");

    let mut missing_field = booking_body();
    missing_field.as_object_mut().unwrap().remove("roomType");

    for (i, body) in [reversed, bad_email, missing_field].into_iter().enumerate() {
        let res = client
            .post(format!("{}/bookings", srv.base_url))
            .header("X-Idempotency-Key", format!("bad-{i}"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "case {i}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "validation_error", "case {i}");
    }
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/bookings/999", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .get(format!("{}/bookings/abc", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_is_paginated_newest_first() {
    let srv = TestServer::spawn(ScriptedOutcomes::new([])).await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        let res = create(&client, &srv.base_url, &format!("k{i}")).await;
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let res = client
        .get(format!("{}/bookings?page=1&limit=2", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["idempotencyKey"], "k2");
    assert_eq!(
        body["meta"],
        json!({
            "count": 2,
            "total": 3,
            "page": 1,
            "pageCount": 2,
            "hasNext": true,
            "hasPrev": false
        })
    );

    let res = client
        .get(format!("{}/bookings?page=-1&limit=200", srv.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["meta"]["page"], 1);
    assert_eq!(body["meta"]["count"], 3);
    assert_eq!(body["meta"]["pageCount"], 1);
}
