//! HTTP API driven through the router without binding a socket.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{date, page, record, TestHarness};
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use sync_service::models::{ApplyResult, SourceItem, SyncSummary};
use sync_service::services::LedgerStore;
use tower::ServiceExt;

async fn send(h: &TestHarness, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = h.router().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_ok_and_echoes_request_id() {
    let h = TestHarness::new();
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();

    let (status, headers, body) = send(&h, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-request-id").unwrap(), "req-42");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "sync-service");
}

#[tokio::test]
async fn ready_without_database_is_ready() {
    let h = TestHarness::new();
    let (status, headers, _) = send(&h, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn metrics_are_exposed() {
    let h = TestHarness::new();
    sync_service::services::init_metrics();
    service_core::observability::metrics::init_recorder();

    let uri = format!("/principals/{}/rollups", h.principal_id);
    let (status, _, _) = send(&h, post_json(&uri, json!({"deltas": []}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&h, get("/metrics")).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("sync_rollup_apply_total"));
    assert!(text.contains("http_requests_total"));
}

#[tokio::test]
async fn principal_sync_then_read_rollups() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script(
        "tok-1",
        None,
        page(
            vec![
                record("t1", date(2025, 1, 1), dec!(10), "Food and Drink"),
                record("t2", date(2025, 1, 2), dec!(-50), "Salary"),
            ],
            vec![],
            vec![],
            "c1",
            false,
        ),
    );

    let (status, _, body) = send(&h, post_json(&format!("/principals/{p}/sync"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let summary: SyncSummary = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.transactions_written, 2);
    assert!(summary.rollup_applied);

    let (status, _, body) = send(&h, get(&format!("/principals/{p}/rollups/2025-01"))).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["period_key"], "2025-01");
    let buckets = body["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0]["category_id"], "Food_and_Drink");
    assert_eq!(buckets[0]["category"], "Food and Drink");
    assert!(body["summary"].is_object());
}

#[tokio::test]
async fn apply_rollups_is_idempotent_per_mutation_id() {
    let h = TestHarness::new();
    let p = h.principal_id;
    let request = json!({
        "deltas": [
            {"op": "add", "date": "2025-01-01", "category": "Food", "type": "expense", "amount": "100"},
            {"op": "add", "category": "Food", "type": "expense", "amount": "1"}
        ],
        "mutation_id": "m-1"
    });

    let uri = format!("/principals/{p}/rollups");
    let (status, _, body) = send(&h, post_json(&uri, request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let first: ApplyResult = serde_json::from_slice(&body).unwrap();
    assert!(first.applied);
    assert!(first.results[0].ok);
    assert!(!first.results[1].ok);

    let (status, _, body) = send(&h, post_json(&uri, request)).await;
    assert_eq!(status, StatusCode::OK);
    let second: ApplyResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(first, second);

    let bucket = h
        .service
        .store()
        .get_rollup(p, "2025-01", "Food")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.expense_total, dec!(100));
}

#[tokio::test]
async fn malformed_delta_values_are_rejected_per_delta() {
    let h = TestHarness::new();
    let p = h.principal_id;
    let request = json!({
        "deltas": [
            {"op": "add", "date": "2025-01-01", "category": "Food", "type": "refund", "amount": "5"},
            {"op": "add", "date": "01/02/2025", "category": "Food", "type": "expense", "amount": "6"},
            {"op": "add", "date": "2025-01-03", "category": "Food", "type": "expense", "amount": "7"}
        ]
    });

    let (status, _, body) = send(&h, post_json(&format!("/principals/{p}/rollups"), request)).await;

    assert_eq!(status, StatusCode::OK);
    let result: ApplyResult = serde_json::from_slice(&body).unwrap();
    assert!(result.applied);
    assert_eq!(result.results[0].errors, vec!["invalid type".to_string()]);
    assert_eq!(result.results[1].errors, vec!["invalid date".to_string()]);
    assert!(result.results[2].ok);
    let bucket = h
        .service
        .store()
        .get_rollup(p, "2025-01", "Food")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.expense_total, dec!(7));
}

#[tokio::test]
async fn unknown_item_is_not_found() {
    let h = TestHarness::new();
    let uri = format!("/principals/{}/items/nope/sync", h.principal_id);

    let (status, _, _) = send(&h, post_json(&uri, json!({}))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn provider_failure_is_bad_gateway() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.fail("tok-1");

    let (status, _, _) = send(&h, post_json(&format!("/principals/{p}/items/item-1/sync"), json!({}))).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn inverted_scope_is_bad_request() {
    let h = TestHarness::new();
    let uri = format!("/principals/{}/sync", h.principal_id);
    let body = json!({"scope": {"start": "2025-02-01", "end": "2025-01-01"}});

    let (status, _, _) = send(&h, post_json(&uri, body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn blank_mutation_id_fails_validation() {
    let h = TestHarness::new();
    let uri = format!("/principals/{}/rollups", h.principal_id);

    let (status, _, _) = send(&h, post_json(&uri, json!({"deltas": [], "mutation_id": ""}))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn missing_period_is_not_found() {
    let h = TestHarness::new();
    let uri = format!("/principals/{}/rollups/1999-01", h.principal_id);

    let (status, _, _) = send(&h, get(&uri)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_principal_id_is_rejected() {
    let h = TestHarness::new();
    let (status, _, _) = send(&h, post_json("/principals/not-a-uuid/sync", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
