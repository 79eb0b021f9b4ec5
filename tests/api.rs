//! HTTP surface through the full middleware stack

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use certdraw::api::ApiServer;
use common::{grid_config, seed, FailingEntropy, Harness};
use std::sync::Arc;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    ApiServer::new(h.engine.clone()).create_app()
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
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_echoes_request_id() {
    let h = Harness::new(grid_config(9, 3));
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-123");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "Running");
    assert_eq!(body["protocol_version"], "certdraw-1.0");
}

#[tokio::test]
async fn test_round_flow_over_http() {
    let h = Harness::new(grid_config(9, 3));
    let app = app(&h);

    let (status, body) = send(&app, "GET", "/round/current", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["round"]["phase"], "setup");
    assert_eq!(body["card_count"], 0);

    let (status, card) = send(&app, "POST", "/cards", Some(json!({ "alias": "ana", "symbols": [1, 2, 3] }))).await;
    assert_eq!(status, StatusCode::OK);
    let traps = card["card"]["cells"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["trap"] == true)
        .count();
    assert_eq!(traps, 0, "traps stay hidden before the round ends");

    let (status, err) = send(&app, "POST", "/cards", Some(json!({ "alias": "bo", "symbols": [1, 2] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["code"], "INVALID_CARD");

    let (status, round) = send(&app, "POST", "/round/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(round["phase"], "live");

    let (status, err) = send(&app, "POST", "/round/call", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["code"], "REVEAL_TOO_EARLY");
    assert_eq!(err["error"]["details"]["severity"], "retryable");
    assert_eq!(err["error"]["details"]["retry_after_ms"], 1_000);

    h.pass_reveal_delay();
    let (status, call) = send(&app, "POST", "/round/call", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(call["position"], 1);

    let (status, ended) = send(&app, "POST", "/round/end", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["phase"], "ended");

    let card_id = card["card"]["id"].as_str().unwrap();
    let (status, revealed) = send(&app, "GET", &format!("/cards/{}", card_id), None).await;
    assert_eq!(status, StatusCode::OK);
    let traps = revealed["card"]["cells"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["trap"] == true)
        .count();
    assert_eq!(traps, 1);

    let (status, next) = send(&app, "POST", "/round/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(next["id"], 2);
}

#[tokio::test]
async fn test_audit_and_verify_endpoints() {
    let h = Harness::new(grid_config(9, 3));
    let app = app(&h);
    send(&app, "POST", "/round/start", None).await;
    h.pass_reveal_delay();
    send(&app, "POST", "/round/call", None).await;

    let (status, system) = send(&app, "GET", "/audit", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(system["integrity_check"]["valid"], true);
    assert_eq!(system["system_info"]["hash_algorithm"], "sha256");

    let (status, trail) = send(&app, "GET", "/audit?roundId=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(trail["audit_trail"].as_array().unwrap().len() >= 3);

    let (status, _) = send(&app, "GET", "/audit?action=round", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, integrity) = send(&app, "GET", "/audit?action=integrity&roundId=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(integrity["valid"], true);

    let hash = h.engine.protocol().commitment(1).await.unwrap().unwrap().commit_hash;
    let uri = format!("/verify?roundId=1&seed={}&commitHash={}", hex::encode(seed()), hash);
    let (status, check) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["valid"], true);

    let (status, report) = send(&app, "GET", "/verify?roundId=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["certified"], true);

    let (status, _) = send(&app, "GET", &format!("/verify?roundId=1&seed={}", hex::encode(seed())), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_export_and_errors() {
    let h = Harness::new(grid_config(9, 3));
    let app = app(&h);

    let (status, export) = send(&app, "GET", "/stats?action=export&samples=5&encoding=hex", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["samples"], 5);
    assert_eq!(export["inline"], true);
    assert_eq!(export["data"].as_array().unwrap().len(), 5);
    assert_eq!(export["data"][0], "07070707");

    let (status, large) = send(&app, "GET", "/stats?action=export&samples=500", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(large["inline"], false);
    assert!(large["data"].is_null());
    assert_eq!(large["preview"].as_array().unwrap().len(), 32);

    let (status, _) = send(&app, "GET", "/stats?action=export&encoding=octal", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, info) = send(&app, "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["battery"]["tests"].as_array().unwrap().len(), 4);

    let (status, _) = send(&app, "GET", "/stats?action=nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, err) = send(&app, "GET", "/cards/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"]["code"], "CARD_NOT_FOUND");
    assert!(err["request_id"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn test_scheduler_endpoints() {
    let h = Harness::new(grid_config(9, 3));
    let app = app(&h);

    let (status, tick) = send(&app, "POST", "/scheduler/tick", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tick["outcome"]["action"], "scheduled");
    assert_eq!(tick["state"]["round_id"], 1);

    let (status, state) = send(&app, "GET", "/scheduler", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["enabled"], true);
}

#[tokio::test]
async fn test_client_cannot_choose_traps() {
    let h = Harness::new(grid_config(9, 3));
    let app = app(&h);

    let body = json!({ "alias": "ana", "symbols": [1, 2, 3], "traps": [] });
    let (status, card) = send(&app, "POST", "/cards", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let card_id = card["card"]["id"].as_str().unwrap().to_string();

    // The stored card carries the house trap regardless of the request.
    let stored = h.engine.rounds().card(&card_id).await.unwrap();
    assert_eq!(stored.cells.iter().filter(|c| c.trap).count(), 1);

    let body = json!({ "alias": "bo", "symbols": [4, 5, 6], "traps": [4, 5, 6] });
    let (status, card) = send(&app, "POST", "/cards", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let stored = h.engine.rounds().card(card["card"]["id"].as_str().unwrap()).await.unwrap();
    assert_eq!(stored.cells.iter().filter(|c| c.trap).count(), 1);
}

#[tokio::test]
async fn test_entropy_failure_halts_engine() {
    let h = Harness::with_entropy(grid_config(9, 3), Arc::new(FailingEntropy));
    let app = app(&h);
    assert!(!h.engine.fatal().is_tripped());

    let (status, err) = send(&app, "POST", "/round/start", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err["error"]["code"], "ENTROPY_UNAVAILABLE");
    assert_eq!(err["error"]["details"]["severity"], "fatal");

    assert!(h.engine.fatal().reason().unwrap().contains("no entropy device"));
    let (status, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "Halted");

    // Nothing was committed for the round.
    assert!(h.engine.protocol().commitment(1).await.unwrap().is_none());
}
