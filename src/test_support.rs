//! Usage: Public test helpers for integration tests (scripted transport, fake OAuth2 client).

use crate::dispatch::executor::TaskExecutor;
use crate::dispatch::retry::RetrySettings;
use crate::dispatch::service::{OAuth2Service, ServiceBootstrap};
use crate::domain::grant::AccessGrant;
use crate::gateway::oauth::client::OAuth2Client;
use crate::gateway::transport::{HttpCall, HttpReply, Transport};
use crate::infra::credential_storage::{CredentialStorage, MemoryCredentialStorage};
use crate::shared::error::{AppResult, RequestError};
use crate::shared::mutex_ext::{MutexExt, RwLockExt};
use crate::shared::BoxFuture;
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub fn grant(access_token: &str, refresh_token: &str) -> AccessGrant {
    AccessGrant::new(access_token, "read", refresh_token, None)
}

/// Resource server double: 200 for the accepted bearer token, 401 for anything else.
pub struct ScriptedTransport {
    accepted_token: RwLock<String>,
    forced_status: Mutex<HashMap<String, u16>>,
    tokens_seen: Mutex<Vec<String>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn accepting(token: &str) -> Arc<Self> {
        Self::with_latency(token, Duration::ZERO)
    }

    pub fn with_latency(token: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            accepted_token: RwLock::new(token.to_string()),
            forced_status: Mutex::new(HashMap::new()),
            tokens_seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            latency,
        })
    }

    pub fn accept_token(&self, token: &str) {
        *self.accepted_token.write_or_recover() = token.to_string();
    }

    /// Every call to `url` fails with `status`, whatever the token.
    pub fn fail_url_with(&self, url: &str, status: u16) {
        self.forced_status
            .lock_or_recover()
            .insert(url.to_string(), status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bearer tokens in call order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock_or_recover().clone()
    }
}

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

impl Transport for ScriptedTransport {
    fn exchange(&self, call: HttpCall) -> BoxFuture<'_, Result<HttpReply, RequestError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = bearer_token(&call.headers);
            self.tokens_seen.lock_or_recover().push(token.clone());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            if let Some(status) = self.forced_status.lock_or_recover().get(&call.url).copied() {
                return Err(RequestError::from_status(status, "scripted failure"));
            }
            if token != *self.accepted_token.read_or_recover() {
                return Err(RequestError::from_status(401, "invalid_token"));
            }
            let body = serde_json::json!({ "url": call.url, "token": token });
            Ok(HttpReply {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(body.to_string()),
            })
        })
    }
}

/// Token endpoint double that counts exchanges.
pub struct FakeOAuth2Client {
    refresh_result: Mutex<Result<AccessGrant, RequestError>>,
    login_result: Mutex<Result<AccessGrant, RequestError>>,
    refresh_tokens_seen: Mutex<Vec<String>>,
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    latency: Duration,
}

impl FakeOAuth2Client {
    pub fn refreshing_to(grant: AccessGrant) -> Self {
        Self {
            refresh_result: Mutex::new(Ok(grant.clone())),
            login_result: Mutex::new(Ok(grant)),
            refresh_tokens_seen: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn failing_refresh(error: RequestError) -> Self {
        let client = Self::refreshing_to(AccessGrant::blank());
        *client.refresh_result.lock_or_recover() = Err(error);
        client
    }

    /// Keeps each exchange in flight for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_login_result(self, result: Result<AccessGrant, RequestError>) -> Self {
        *self.login_result.lock_or_recover() = result;
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen.lock_or_recover().clone()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl OAuth2Client for FakeOAuth2Client {
    fn exchange_credentials<'a>(
        &'a self,
        _username: &'a str,
        _password: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>> {
        Box::pin(async move {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            self.login_result.lock_or_recover().clone()
        })
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_tokens_seen
                .lock_or_recover()
                .push(refresh_token.to_string());
            self.pause().await;
            self.refresh_result.lock_or_recover().clone()
        })
    }
}

/// Fixed client and initial grant.
pub struct StaticBootstrap {
    pub client: Arc<dyn OAuth2Client>,
    pub grant: AccessGrant,
}

impl ServiceBootstrap for StaticBootstrap {
    fn create_oauth2_client(&self) -> AppResult<Arc<dyn OAuth2Client>> {
        Ok(Arc::clone(&self.client))
    }

    fn create_access_grant(&self) -> AccessGrant {
        self.grant.clone()
    }
}

/// Service over in-memory storage. Must be called from within a tokio runtime.
pub fn start_service(
    client: Arc<dyn OAuth2Client>,
    initial: AccessGrant,
    retry_settings: RetrySettings,
) -> AppResult<OAuth2Service> {
    start_service_with_storage(
        client,
        initial,
        retry_settings,
        Arc::new(MemoryCredentialStorage::new()),
    )
}

pub fn start_service_with_storage(
    client: Arc<dyn OAuth2Client>,
    initial: AccessGrant,
    retry_settings: RetrySettings,
    storage: Arc<dyn CredentialStorage>,
) -> AppResult<OAuth2Service> {
    let bootstrap = StaticBootstrap {
        client,
        grant: initial,
    };
    OAuth2Service::start(TaskExecutor::new(4), &bootstrap, storage, retry_settings)
}
