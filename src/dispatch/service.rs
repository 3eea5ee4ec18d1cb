//! Usage: `OAuth2Service`, the dispatcher that classifies submissions by credential capability
//! and wires refresh coordination around them.
//!
//! - Consumers get a fresh `RefreshCoordinator`, are registered for rebinding and unregistered
//!   on their terminal outcome.
//! - Producers get a listener, ahead of the caller's, that installs the produced grant.
//! - Anything else passes through untouched.

use super::executor::{ExecutionService, RequestHandle, TaskExecutor};
use super::request::{Request, RequestListener};
use super::retry::{RetryPolicy, RetrySettings};
use crate::credential::refresh::{RefreshCoordinator, RefreshGate, RefreshLauncher};
use crate::credential::registry::{AuthenticatedRequestRegistry, RequestId};
use crate::credential::store::{CredentialSnapshot, CredentialStore};
use crate::domain::grant::AccessGrant;
use crate::gateway::oauth::access_requests::{CredentialsAccessRequest, RefreshAccessRequest};
use crate::gateway::oauth::client::OAuth2Client;
use crate::infra::credential_storage::CredentialStorage;
use crate::shared::error::{AppResult, RequestError};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Caller-supplied factories used once at start-up.
pub trait ServiceBootstrap {
    fn create_oauth2_client(&self) -> AppResult<Arc<dyn OAuth2Client>>;

    /// Initial grant when storage holds none.
    fn create_access_grant(&self) -> AccessGrant;
}

pub struct OAuth2Service<E: ExecutionService = TaskExecutor> {
    inner: Arc<ServiceInner<E>>,
}

impl<E: ExecutionService> Clone for OAuth2Service<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<E: ExecutionService> {
    executor: E,
    store: Arc<CredentialStore>,
    registry: Arc<AuthenticatedRequestRegistry>,
    refresh_gate: Arc<RefreshGate>,
    oauth_client: Arc<dyn OAuth2Client>,
    retry_settings: RetrySettings,
    weak_self: Weak<ServiceInner<E>>,
}

impl<E: ExecutionService> OAuth2Service<E> {
    pub fn start(
        executor: E,
        bootstrap: &dyn ServiceBootstrap,
        storage: Arc<dyn CredentialStorage>,
        retry_settings: RetrySettings,
    ) -> AppResult<Self> {
        let oauth_client = bootstrap.create_oauth2_client()?;
        let store = Arc::new(CredentialStore::bootstrap(storage, || {
            bootstrap.create_access_grant()
        })?);
        let registry = Arc::new(AuthenticatedRequestRegistry::new());
        store.add_observer(registry.clone());

        let inner = Arc::new_cyclic(|weak_self| ServiceInner {
            executor,
            store,
            registry,
            refresh_gate: RefreshGate::new(),
            oauth_client,
            retry_settings,
            weak_self: weak_self.clone(),
        });
        tracing::info!(
            generation = inner.store.generation(),
            refresh_retry_budget = retry_settings.refresh_retry_budget,
            retries_after_refresh = retry_settings.retries_after_refresh,
            "oauth2 service started"
        );
        Ok(Self { inner })
    }

    /// Submits `request`; the handle resolves after every listener has run.
    pub fn submit<R: Request>(
        &self,
        request: R,
        listeners: Vec<Arc<dyn RequestListener<R::Output>>>,
    ) -> RequestHandle<R::Output> {
        self.inner.dispatch(Arc::new(request), listeners)
    }

    /// Like `submit`, keeping a handle on the request. A credential-consuming request that is
    /// still in flight from an earlier submission resolves to `RequestError::AlreadyActive`.
    pub fn submit_shared<R: Request>(
        &self,
        request: Arc<R>,
        listeners: Vec<Arc<dyn RequestListener<R::Output>>>,
    ) -> RequestHandle<R::Output> {
        self.inner.dispatch(request, listeners)
    }

    /// Submits `request` and waits for its terminal outcome.
    pub async fn execute<R: Request>(&self, request: R) -> Result<R::Output, RequestError> {
        self.submit(request, Vec::new()).outcome().await
    }

    /// Username/password login; the resulting grant replaces the current one.
    pub fn login(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> RequestHandle<AccessGrant> {
        let request = CredentialsAccessRequest::new(
            Arc::clone(&self.inner.oauth_client),
            username,
            password,
        );
        self.submit(request, Vec::new())
    }

    pub fn current_grant(&self) -> Arc<AccessGrant> {
        self.inner.store.current().grant
    }

    pub fn current_snapshot(&self) -> CredentialSnapshot {
        self.inner.store.current()
    }

    /// Installs `grant` and rebinds every outstanding request. Returns the new generation.
    pub fn set_current_grant(&self, grant: AccessGrant) -> u64 {
        self.inner.store.replace(grant)
    }

    pub fn subscribe(&self) -> watch::Receiver<CredentialSnapshot> {
        self.inner.store.subscribe()
    }

    pub fn registry(&self) -> &AuthenticatedRequestRegistry {
        &self.inner.registry
    }

    pub fn refresh_gate(&self) -> &RefreshGate {
        &self.inner.refresh_gate
    }

    pub fn executor(&self) -> &E {
        &self.inner.executor
    }

    pub fn oauth2_client(&self) -> Arc<dyn OAuth2Client> {
        Arc::clone(&self.inner.oauth_client)
    }
}

impl<E: ExecutionService> ServiceInner<E> {
    fn dispatch<R: Request>(
        &self,
        request: Arc<R>,
        mut listeners: Vec<Arc<dyn RequestListener<R::Output>>>,
    ) -> RequestHandle<R::Output> {
        let mut retry_policy: Option<Arc<dyn RetryPolicy>> = None;

        if let Some(consumer) = request.as_credential_consumer() {
            let binding = consumer.grant_binding().clone();
            if self.registry.register(&binding, &self.store).is_none() {
                tracing::warn!(
                    request = %binding.id(),
                    "request submitted again while still in flight; rejecting"
                );
                let error = RequestError::AlreadyActive;
                for listener in &listeners {
                    listener.on_request_failure(&error);
                }
                return RequestHandle::rejected(error);
            }
            let launcher: Weak<dyn RefreshLauncher> = self.weak_self.clone();
            retry_policy = Some(Arc::new(RefreshCoordinator::new(
                self.retry_settings,
                binding.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.refresh_gate),
                launcher,
            )));
            listeners.push(Arc::new(UnregisterOnCompletion {
                registry: Arc::clone(&self.registry),
                id: binding.id(),
            }));
        } else if request.as_credential_producer().is_some() {
            listeners.insert(
                0,
                Arc::new(InstallProducedGrant {
                    store: Arc::clone(&self.store),
                    request: Arc::clone(&request),
                }),
            );
        }

        self.executor.submit(request, retry_policy, listeners)
    }
}

impl<E: ExecutionService> RefreshLauncher for ServiceInner<E> {
    fn launch_refresh(&self, refresh_token: String, listener: Arc<dyn RequestListener<AccessGrant>>) {
        let request = RefreshAccessRequest::new(Arc::clone(&self.oauth_client), refresh_token);
        // Detached: the refresh runs to completion even if every waiter is cancelled.
        let _handle = self.dispatch(Arc::new(request), vec![listener]);
    }
}

struct UnregisterOnCompletion {
    registry: Arc<AuthenticatedRequestRegistry>,
    id: RequestId,
}

impl<T> RequestListener<T> for UnregisterOnCompletion {
    fn on_request_success(&self, _output: &T) {
        self.registry.unregister(self.id);
    }

    fn on_request_failure(&self, _error: &RequestError) {
        self.registry.unregister(self.id);
    }
}

struct InstallProducedGrant<R> {
    store: Arc<CredentialStore>,
    request: Arc<R>,
}

impl<R: Request> RequestListener<R::Output> for InstallProducedGrant<R> {
    fn on_request_success(&self, output: &R::Output) {
        if let Some(producer) = self.request.as_credential_producer() {
            self.store.replace(producer.produced_grant(output));
        }
    }

    fn on_request_failure(&self, _error: &RequestError) {}
}
