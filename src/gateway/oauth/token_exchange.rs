//! Usage: OAuth2 token endpoint form building and response parsing (password + refresh_token
//! grants).

use crate::domain::grant::AccessGrant;
use crate::shared::error::RequestError;
use crate::shared::security::mask_token;
use serde_json::Value;

const ERROR_SNIPPET_MAX_CHARS: usize = 500;
const ERROR_MESSAGE_MAX_CHARS: usize = 240;

/// Token endpoint coordinates shared by every grant type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEndpoint {
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Requested scope; empty means the server default.
    pub scope: String,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TokenGrant<'a> {
    Password { username: &'a str, password: &'a str },
    RefreshToken { refresh_token: &'a str },
}

pub(crate) fn build_token_form(
    endpoint: &TokenEndpoint,
    grant: TokenGrant<'_>,
) -> Vec<(&'static str, String)> {
    let mut form: Vec<(&'static str, String)> = Vec::with_capacity(6);
    match grant {
        TokenGrant::Password { username, password } => {
            form.push(("grant_type", "password".to_string()));
            form.push(("username", username.trim().to_string()));
            form.push(("password", password.to_string()));
        }
        TokenGrant::RefreshToken { refresh_token } => {
            form.push(("grant_type", "refresh_token".to_string()));
            form.push(("refresh_token", refresh_token.trim().to_string()));
        }
    }
    form.push(("client_id", endpoint.client_id.trim().to_string()));
    if let Some(secret) = endpoint.client_secret.as_deref().map(str::trim) {
        if !secret.is_empty() {
            form.push(("client_secret", secret.to_string()));
        }
    }
    let scope = endpoint.scope.trim();
    if !scope.is_empty() {
        form.push(("scope", scope.to_string()));
    }
    form
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OAuthTokenSet {
    pub(crate) access_token: String,
    pub(crate) refresh_token: Option<String>,
    pub(crate) scope: Option<String>,
    pub(crate) expires_in: Option<i64>,
}

impl OAuthTokenSet {
    /// Fields the server omitted fall back to the previous grant's values (refresh-token
    /// rotation is optional for servers).
    pub(crate) fn into_grant(
        self,
        previous_refresh_token: &str,
        requested_scope: &str,
        now_unix: i64,
    ) -> AccessGrant {
        let refresh_token = self
            .refresh_token
            .unwrap_or_else(|| previous_refresh_token.trim().to_string());
        let scope = self
            .scope
            .unwrap_or_else(|| requested_scope.trim().to_string());
        AccessGrant::with_expires_in(
            self.access_token,
            scope,
            refresh_token,
            self.expires_in,
            now_unix,
        )
    }
}

pub(crate) fn parse_token_response(status: u16, body: &str) -> Result<OAuthTokenSet, RequestError> {
    if !(200..300).contains(&status) {
        return Err(token_endpoint_error(status, body));
    }

    let value: Value = serde_json::from_str(body).map_err(|e| {
        RequestError::InvalidResponse(format!("oauth token response json invalid: {e}"))
    })?;

    let access_token = non_empty_str(&value, "access_token")
        .ok_or_else(|| {
            RequestError::InvalidResponse("oauth token response missing access_token".to_string())
        })?;

    Ok(OAuthTokenSet {
        access_token,
        refresh_token: non_empty_str(&value, "refresh_token"),
        scope: non_empty_str(&value, "scope"),
        expires_in: value.get("expires_in").and_then(parse_i64_lossy),
    })
}

fn token_endpoint_error(status: u16, body: &str) -> RequestError {
    let (error_code, error_message) = parse_oauth_error_details(body);
    if status == 401 && requires_new_login(error_code.as_deref(), error_message.as_deref())
    {
        tracing::warn!("oauth refresh token rejected by token endpoint; a new login is required");
    }

    let mut detail = String::new();
    if let Some(code) = error_code {
        detail.push_str("code=");
        detail.push_str(code.as_str());
        detail.push(' ');
    }
    if let Some(message) = error_message {
        detail.push_str("message=");
        detail.push_str(
            message
                .chars()
                .take(ERROR_MESSAGE_MAX_CHARS)
                .collect::<String>()
                .as_str(),
        );
        detail.push(' ');
    }
    detail.push_str("snippet=");
    detail.push_str(sanitize_oauth_error_body_snippet(body).as_str());
    RequestError::from_status(status, detail)
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token")
        || key_lc.contains("secret")
        || key_lc.contains("password")
        || key_lc == "authorization"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_sensitive_json_fields),
        _ => {}
    }
}

pub(crate) fn sanitize_oauth_error_body_snippet(body: &str) -> String {
    if let Ok(mut value) = serde_json::from_str::<Value>(body) {
        redact_sensitive_json_fields(&mut value);
        if let Ok(encoded) = serde_json::to_string(&value) {
            return encoded.chars().take(ERROR_SNIPPET_MAX_CHARS).collect();
        }
    }
    body.chars().take(ERROR_SNIPPET_MAX_CHARS).collect()
}

/// Reads `error`/`error_description` (RFC 6749) or a nested `error.code`/`error.message`.
fn parse_oauth_error_details(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };

    let mut code = non_empty_str(&value, "code");
    let mut message = non_empty_str(&value, "error_description");

    match value.get("error") {
        Some(Value::String(err)) if code.is_none() => {
            code = Some(err.trim().to_string()).filter(|v| !v.is_empty());
        }
        Some(Value::Object(err)) => {
            if code.is_none() {
                code = err
                    .get("code")
                    .and_then(Value::as_str)
                    .or_else(|| err.get("type").and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
            }
            if message.is_none() {
                message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
            }
        }
        _ => {}
    }

    (code, message)
}

fn requires_new_login(code: Option<&str>, message: Option<&str>) -> bool {
    let code_hit = code.map(str::trim).is_some_and(|v| {
        v.eq_ignore_ascii_case("refresh_token_reused") || v.eq_ignore_ascii_case("invalid_grant")
    });
    if code_hit {
        return true;
    }
    message
        .map(str::to_ascii_lowercase)
        .is_some_and(|v| v.contains("refresh token has already been used"))
}
