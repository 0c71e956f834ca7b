use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::{Json, Router};
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use toxic_sync::notifier::{HttpNotifier, NotifyError, Notifier};

#[derive(Clone)]
struct Endpoint {
    status: StatusCode,
    seen: Arc<Mutex<Vec<(Option<String>, String)>>>,
}

async fn hook(State(ep): State<Endpoint>, headers: HeaderMap, body: String) -> (StatusCode, Json<Value>) {
    let post_id = headers
        .get("post-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    ep.seen.lock().await.push((post_id.clone(), body));
    (ep.status, Json(json!({ "headers": { "Post-Id": post_id } })))
}

async fn serve(status: StatusCode) -> (Url, Endpoint) {
    let ep = Endpoint {
        status,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new().route("/put", put(hook)).with_state(ep.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{}/put", addr)).unwrap(), ep)
}

#[tokio::test]
async fn sends_put_with_correlation_header_and_returns_body() {
    let (url, ep) = serve(StatusCode::OK).await;
    let notifier = HttpNotifier::new(url, false).unwrap();

    let response = notifier.send(Some("ext-7")).await.unwrap();
    assert_eq!(response["headers"]["Post-Id"], json!("ext-7"));

    let seen = ep.seen.lock().await.clone();
    assert_eq!(seen, vec![(Some("ext-7".to_string()), "{}".to_string())]);
}

#[tokio::test]
async fn error_status_is_success_by_default() {
    let (url, _ep) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
    let notifier = HttpNotifier::new(url, false).unwrap();
    assert!(notifier.send(Some("ext-7")).await.is_ok());
}

#[tokio::test]
async fn error_status_fails_when_strict() {
    let (url, _ep) = serve(StatusCode::BAD_GATEWAY).await;
    let notifier = HttpNotifier::new(url, true).unwrap();
    let err = notifier.send(Some("ext-7")).await.unwrap_err();
    assert!(matches!(err, NotifyError::Status { status: 502, .. }));
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("http://{}/put", addr)).unwrap();
    let notifier = HttpNotifier::new(url, false).unwrap();
    let err = notifier.send(Some("ext-7")).await.unwrap_err();
    assert!(matches!(err, NotifyError::Transport(_)));
}
