//! Helper for the broker's administrative HTTP API.

use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Accept header asking for the versioned response format.
pub const ACCEPT_V1: &str = "application/vnd.nsq; version=1.0";

/// Response header marking a bare, unwrapped body.
pub const NSQ_CONTENT_TYPE: &str = "X-NSQ-Content-Type";

const NSQ_CONTENT_TYPE_V1: &[u8] = b"nsq; version=1.0";

/// Errors from [`api_request_negotiate_v1`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be sent or its body could not be read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with something other than `200 OK`.
    #[error("for ({addr}) got response {status} {body:?}")]
    Status {
        /// Remote address the response came from.
        ///
        /// Only the remote end is reported; `reqwest` does not expose the local address
        /// of the connection a response arrived on.
        addr: String,
        /// Response status.
        status: StatusCode,
        /// Response body, lossily decoded.
        body: String,
    },

    /// The body did not match the requested type.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Legacy response envelope; only `data` is of interest.
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    data: T,
}

/// Perform one request against an `nsqd` or `nsqlookupd` HTTP endpoint.
///
/// The body is decoded as `T` directly when the endpoint speaks the versioned format,
/// otherwise `T` is taken from the `data` member of the legacy envelope. An empty body
/// decodes as `{}`.
///
/// # Errors
///
/// Returns [`ApiError::Status`] for any status other than `200 OK`, and an error if the
/// request fails or the body cannot be decoded.
pub async fn api_request_negotiate_v1<T>(
    client: &Client,
    method: Method,
    endpoint: &str,
    headers: HeaderMap,
) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    let response = client
        .request(method, endpoint)
        .headers(headers)
        .header(ACCEPT, ACCEPT_V1)
        .send()
        .await?;

    let addr = response
        .remote_addr()
        .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
    let status = response.status();
    let negotiated = response
        .headers()
        .get(NSQ_CONTENT_TYPE)
        .is_some_and(|value| value.as_bytes() == NSQ_CONTENT_TYPE_V1);
    let body = response.bytes().await?;

    if status != StatusCode::OK {
        return Err(ApiError::Status {
            addr,
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let body: &[u8] = if body.is_empty() { b"{}" } else { &body };

    if negotiated {
        return Ok(serde_json::from_slice(body)?);
    }

    let envelope: Envelope<T> = serde_json::from_slice(body)?;
    Ok(envelope.data)
}
