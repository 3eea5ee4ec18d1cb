//! Usage: HTTP transport seam (`Transport`), the reqwest implementation, and bearer header
//! building.

use crate::shared::error::{AppResult, RequestError};
use crate::shared::BoxFuture;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_MAX_CHARS: usize = 500;

/// One outgoing HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

/// A 2xx response. Non-2xx responses surface as `RequestError` instead.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub trait Transport: Send + Sync {
    fn exchange(&self, call: HttpCall) -> BoxFuture<'_, Result<HttpReply, RequestError>>;
}

/// `Authorization: Bearer <token>`, marked sensitive so it never shows in debug output.
pub fn build_auth_header(access_token: &str) -> Result<HeaderMap, RequestError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))
        .map_err(|_| {
            RequestError::Transport("access token contains invalid header characters".to_string())
        })?;
    value.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| format!("SYSTEM_ERROR: failed to build http client: {e}"))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn exchange(&self, call: HttpCall) -> BoxFuture<'_, Result<HttpReply, RequestError>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(call.method, call.url.as_str())
                .headers(call.headers);
            if let Some(body) = call.body {
                let encoded = serde_json::to_vec(&body).map_err(|e| {
                    RequestError::Transport(format!("failed to encode request body: {e}"))
                })?;
                builder = builder
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .body(encoded);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| RequestError::Transport(format!("http request failed: {e}")))?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| RequestError::Transport(format!("http response read failed: {e}")))?;

            if !(200..300).contains(&status) {
                return Err(RequestError::from_status(status, error_body_snippet(&body)));
            }
            Ok(HttpReply {
                status,
                headers,
                body,
            })
        })
    }
}

pub(crate) fn error_body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(ERROR_BODY_MAX_CHARS)
        .collect()
}
