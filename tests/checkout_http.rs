use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use intakeflow::flows::answers::AnswerStore;
use intakeflow::flows::builtin_flows;
use intakeflow::flows::submit::{
    build_request, interpret, new_idempotency_key, CheckoutClient, HttpCheckoutClient,
    SubmitError,
};

// ── Fake checkout service ─────────────────────────────────────────

#[derive(Clone, Default)]
struct Seen {
    calls: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

fn record(seen: &Seen, headers: &HeaderMap, body: Value) {
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    seen.calls.lock().unwrap().push((key, body));
}

async fn handle_ok(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    record(&seen, &headers, body);
    Json(json!({ "success": true, "checkoutUrl": "https://pay.example/s/42" }))
}

async fn handle_no_url(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    record(&seen, &headers, body);
    Json(json!({ "success": true }))
}

async fn handle_reject(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    record(&seen, &headers, body);
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "success": false, "error": "Your session has expired" })),
    )
        .into_response()
}

async fn handle_broken() -> Response {
    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
}

async fn handle_slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({ "success": true, "checkoutUrl": "https://pay.example/late" }))
}

async fn spawn_server(seen: Seen) -> Result<String> {
    let app = Router::new()
        .route("/ok", post(handle_ok))
        .route("/no-url", post(handle_no_url))
        .route("/reject", post(handle_reject))
        .route("/broken", post(handle_broken))
        .route("/slow", post(handle_slow))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn prescription_request() -> intakeflow::flows::submit::CheckoutRequest {
    let flows = builtin_flows().unwrap();
    let mut answers = AnswerStore::new();
    answers.set("rx_type", "repeat");
    answers.set("condition", "asthma");
    build_request(&flows["prescription"], &answers, new_idempotency_key())
}

// ═══════════════════════════════════════════════════════════════════
// HttpCheckoutClient against a live server
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn posts_body_and_idempotency_header() -> Result<()> {
    let seen = Seen::default();
    let base = spawn_server(seen.clone()).await?;
    let client = HttpCheckoutClient::new(&format!("{base}/ok"), Duration::from_secs(5))?;
    let request = prescription_request();

    let resp = client.create_checkout(&request).await?;
    assert_eq!(interpret(resp), Ok("https://pay.example/s/42".to_string()));

    let calls = seen.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let (key, body) = &calls[0];
    assert_eq!(key.as_deref(), Some(request.idempotency_key.as_str()));
    assert_eq!(body["idempotencyKey"], request.idempotency_key.as_str());
    assert_eq!(body["category"], "prescription");
    assert_eq!(body["type"], "repeat_script");
    assert_eq!(body["answers"]["prescription_type"], "repeat");
    assert_eq!(body["answers"]["condition"], "asthma");
    Ok(())
}

#[tokio::test]
async fn success_without_url_is_an_error() -> Result<()> {
    let base = spawn_server(Seen::default()).await?;
    let client = HttpCheckoutClient::new(&format!("{base}/no-url"), Duration::from_secs(5))?;
    let resp = client.create_checkout(&prescription_request()).await?;
    assert_eq!(interpret(resp), Err(SubmitError::MissingCheckoutUrl));
    Ok(())
}

#[tokio::test]
async fn error_body_is_surfaced_even_with_error_status() -> Result<()> {
    let base = spawn_server(Seen::default()).await?;
    let client = HttpCheckoutClient::new(&format!("{base}/reject"), Duration::from_secs(5))?;
    let resp = client.create_checkout(&prescription_request()).await?;
    let err = interpret(resp).unwrap_err();
    assert_eq!(err.user_message(), "Your session has expired");
    Ok(())
}

#[tokio::test]
async fn non_json_failure_is_a_transport_error() -> Result<()> {
    let base = spawn_server(Seen::default()).await?;
    let client = HttpCheckoutClient::new(&format!("{base}/broken"), Duration::from_secs(5))?;
    let err = client
        .create_checkout(&prescription_request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("502"));
    Ok(())
}

#[tokio::test]
async fn slow_endpoint_times_out() -> Result<()> {
    let base = spawn_server(Seen::default()).await?;
    let client = HttpCheckoutClient::new(&format!("{base}/slow"), Duration::from_millis(200))?;
    assert!(client.create_checkout(&prescription_request()).await.is_err());
    Ok(())
}
