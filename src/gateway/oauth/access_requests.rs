//! Usage: Credential-producing requests (password login, token refresh).

use super::client::OAuth2Client;
use crate::dispatch::request::{ProducesCredential, Request};
use crate::domain::grant::AccessGrant;
use crate::shared::error::RequestError;
use crate::shared::BoxFuture;
use std::sync::Arc;

/// Exchanges username/password for a grant. On success the dispatcher installs the grant.
pub struct CredentialsAccessRequest {
    client: Arc<dyn OAuth2Client>,
    username: String,
    password: String,
}

impl CredentialsAccessRequest {
    pub fn new(
        client: Arc<dyn OAuth2Client>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for CredentialsAccessRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsAccessRequest")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Request for CredentialsAccessRequest {
    type Output = AccessGrant;

    fn execute_network_call(&self) -> BoxFuture<'_, Result<AccessGrant, RequestError>> {
        self.client
            .exchange_credentials(&self.username, &self.password)
    }

    fn label(&self) -> &'static str {
        "credentials_access"
    }

    fn as_credential_producer(&self) -> Option<&dyn ProducesCredential<AccessGrant>> {
        Some(self)
    }
}

impl ProducesCredential<AccessGrant> for CredentialsAccessRequest {
    fn produced_grant(&self, output: &AccessGrant) -> AccessGrant {
        output.clone()
    }
}

/// The refresh exchange submitted on behalf of requests that failed with 401.
pub struct RefreshAccessRequest {
    client: Arc<dyn OAuth2Client>,
    refresh_token: String,
}

impl RefreshAccessRequest {
    pub fn new(client: Arc<dyn OAuth2Client>, refresh_token: impl Into<String>) -> Self {
        Self {
            client,
            refresh_token: refresh_token.into(),
        }
    }
}

impl Request for RefreshAccessRequest {
    type Output = AccessGrant;

    fn execute_network_call(&self) -> BoxFuture<'_, Result<AccessGrant, RequestError>> {
        self.client.refresh_token(&self.refresh_token)
    }

    fn label(&self) -> &'static str {
        "refresh_access"
    }

    fn as_credential_producer(&self) -> Option<&dyn ProducesCredential<AccessGrant>> {
        Some(self)
    }
}

impl ProducesCredential<AccessGrant> for RefreshAccessRequest {
    fn produced_grant(&self, output: &AccessGrant) -> AccessGrant {
        output.clone()
    }
}
