//! Usage: OAuth2 client seam (`OAuth2Client`) and the reqwest-backed token endpoint client.

use super::token_exchange::{build_token_form, parse_token_response, TokenEndpoint, TokenGrant};
use crate::domain::grant::AccessGrant;
use crate::shared::error::{AppResult, RequestError};
use crate::shared::time::now_unix_seconds;
use crate::shared::BoxFuture;
use std::time::Duration;

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Performs the OAuth2 handshake against a token endpoint.
pub trait OAuth2Client: Send + Sync {
    /// Resource-owner password credentials grant.
    fn exchange_credentials<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>>;

    /// Exchanges `refresh_token` for a new grant. A response without a refresh token keeps
    /// the one passed in.
    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>>;
}

#[derive(Debug, Clone)]
pub struct HttpOAuth2Client {
    http: reqwest::Client,
    endpoint: TokenEndpoint,
}

impl HttpOAuth2Client {
    pub fn new(endpoint: TokenEndpoint) -> AppResult<Self> {
        validate_endpoint(&endpoint)?;
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| format!("SYSTEM_ERROR: failed to build oauth http client: {e}"))?;
        Ok(Self { http, endpoint })
    }

    /// Shares an existing connection pool.
    pub fn with_client(http: reqwest::Client, endpoint: TokenEndpoint) -> AppResult<Self> {
        validate_endpoint(&endpoint)?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &TokenEndpoint {
        &self.endpoint
    }

    async fn request_grant(
        &self,
        grant: TokenGrant<'_>,
        previous_refresh_token: &str,
    ) -> Result<AccessGrant, RequestError> {
        let form = build_token_form(&self.endpoint, grant);
        let response = self
            .http
            .post(self.endpoint.token_uri.trim())
            .form(&form)
            .send()
            .await
            .map_err(|e| RequestError::Transport(format!("oauth token request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            RequestError::Transport(format!("oauth token response read failed: {e}"))
        })?;

        let token_set = parse_token_response(status, &body)?;
        Ok(token_set.into_grant(
            previous_refresh_token,
            &self.endpoint.scope,
            now_unix_seconds(),
        ))
    }
}

fn validate_endpoint(endpoint: &TokenEndpoint) -> AppResult<()> {
    let token_uri = endpoint.token_uri.trim();
    if token_uri.is_empty() {
        return Err("SEC_INVALID_INPUT: oauth token_uri is required".into());
    }
    if !(token_uri.starts_with("https://") || token_uri.starts_with("http://")) {
        return Err(format!("SEC_INVALID_INPUT: oauth token_uri must be http(s): {token_uri}").into());
    }
    if endpoint.client_id.trim().is_empty() {
        return Err("SEC_INVALID_INPUT: oauth client_id is required".into());
    }
    Ok(())
}

impl OAuth2Client for HttpOAuth2Client {
    fn exchange_credentials<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>> {
        Box::pin(self.request_grant(TokenGrant::Password { username, password }, ""))
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<AccessGrant, RequestError>> {
        Box::pin(self.request_grant(TokenGrant::RefreshToken { refresh_token }, refresh_token))
    }
}
