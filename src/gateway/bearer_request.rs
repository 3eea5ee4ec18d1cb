//! Usage: Base for requests authenticated with the shared grant (`Authorization: Bearer`).

use super::transport::{build_auth_header, HttpCall, Transport};
use crate::credential::registry::GrantBinding;
use crate::dispatch::request::{ConsumesCredential, Request};
use crate::shared::error::RequestError;
use crate::shared::BoxFuture;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// A JSON API call that sends whatever grant the dispatcher bound to it.
///
/// The response body is decoded into `T`; an empty body decodes as JSON `null`.
pub struct BearerRequest<T> {
    transport: Arc<dyn Transport>,
    method: Method,
    url: String,
    body: Option<serde_json::Value>,
    binding: GrantBinding,
    _output: PhantomData<fn() -> T>,
}

impl<T> BearerRequest<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(transport: Arc<dyn Transport>, method: Method, url: impl Into<String>) -> Self {
        Self {
            transport,
            method,
            url: url.into(),
            body: None,
            binding: GrantBinding::new(),
            _output: PhantomData,
        }
    }

    pub fn get(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self::new(transport, Method::GET, url)
    }

    /// JSON entity sent with every attempt (POST/PUT/PATCH).
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    async fn attempt(&self) -> Result<T, RequestError> {
        let bound = self.grant_for_attempt().ok_or_else(|| {
            RequestError::Transport("no access grant bound to request".to_string())
        })?;
        let headers = build_auth_header(bound.grant.access_token())?;
        let reply = self
            .transport
            .exchange(HttpCall {
                method: self.method.clone(),
                url: self.url.clone(),
                headers,
                body: self.body.clone(),
            })
            .await?;
        decode_json_body(&reply.body)
    }
}

fn decode_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RequestError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| RequestError::InvalidResponse(format!("response json invalid: {e}")))
}

impl<T> Request for BearerRequest<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn execute_network_call(&self) -> BoxFuture<'_, Result<T, RequestError>> {
        Box::pin(self.attempt())
    }

    fn label(&self) -> &'static str {
        "bearer_request"
    }

    fn as_credential_consumer(&self) -> Option<&dyn ConsumesCredential> {
        Some(self)
    }
}

impl<T> ConsumesCredential for BearerRequest<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn grant_binding(&self) -> &GrantBinding {
        &self.binding
    }
}
