//! Tests for the administrative HTTP helper.

use std::net::SocketAddr;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use proven_nsq_producer::api::{ACCEPT_V1, ApiError, api_request_negotiate_v1};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
struct Info {
    version: String,
    accept: String,
}

fn accept(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn negotiated(headers: HeaderMap) -> impl IntoResponse {
    (
        [("x-nsq-content-type", "nsq; version=1.0")],
        axum::Json(json!({ "version": "1.3.0", "accept": accept(&headers) })),
    )
}

async fn legacy() -> impl IntoResponse {
    axum::Json(json!({
        "status_code": 200,
        "status_txt": "OK",
        "data": { "version": "0.3.8" },
    }))
}

async fn empty() -> StatusCode {
    StatusCode::OK
}

async fn missing() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "TOPIC_NOT_FOUND")
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/info", get(negotiated))
        .route("/legacy", get(legacy))
        .route("/empty", get(empty))
        .route("/missing", get(missing));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn request(addr: SocketAddr, path: &str) -> Result<Info, ApiError> {
    api_request_negotiate_v1(
        &reqwest::Client::new(),
        Method::GET,
        &format!("http://{addr}{path}"),
        reqwest::header::HeaderMap::new(),
    )
    .await
}

#[tokio::test]
async fn test_negotiated_body_decoded_directly() {
    let addr = serve().await;

    let info = request(addr, "/info").await.unwrap();

    assert_eq!(info.version, "1.3.0");
    assert_eq!(info.accept, ACCEPT_V1);
}

#[tokio::test]
async fn test_legacy_envelope_unwrapped() {
    let addr = serve().await;

    let info = request(addr, "/legacy").await.unwrap();

    assert_eq!(info.version, "0.3.8");
}

#[tokio::test]
async fn test_empty_body_decodes_as_default() {
    let addr = serve().await;

    let info = request(addr, "/empty").await.unwrap();

    assert_eq!(info, Info::default());
}

#[tokio::test]
async fn test_error_status_reports_address_and_body() {
    let addr = serve().await;

    let err = request(addr, "/missing").await.unwrap_err();
    assert!(
        err.to_string()
            .starts_with(&format!("for ({addr}) got response 404 Not Found"))
    );

    match err {
        ApiError::Status {
            addr: remote,
            status,
            body,
        } => {
            assert_eq!(remote, addr.to_string());
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body, "TOPIC_NOT_FOUND");
        }
        other => panic!("unexpected error: {other}"),
    }
}
