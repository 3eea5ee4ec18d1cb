//! Usage: `AccessGrant` value type (access token, scope, refresh token, expiry).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable OAuth2 grant. A new grant always replaces the old one wholesale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccessGrant {
    access_token: String,
    scope: String,
    refresh_token: String,
    /// Absolute expiry in unix seconds; `0` means unknown.
    expires_at: i64,
}

impl AccessGrant {
    pub fn new(
        access_token: impl Into<String>,
        scope: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Option<i64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            scope: scope.into(),
            refresh_token: refresh_token.into(),
            expires_at: expires_at.filter(|v| *v > 0).unwrap_or(0),
        }
    }

    /// Builds a grant from a relative `expires_in` as returned by token endpoints.
    pub fn with_expires_in(
        access_token: impl Into<String>,
        scope: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: Option<i64>,
        now_unix: i64,
    ) -> Self {
        let expires_at = expires_in
            .filter(|v| *v > 0)
            .map(|v| now_unix.saturating_add(v));
        Self::new(access_token, scope, refresh_token, expires_at)
    }

    /// Blank grant used before the first credential exchange.
    pub fn blank() -> Self {
        Self::default()
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> Option<i64> {
        (self.expires_at > 0).then_some(self.expires_at)
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at().is_some_and(|expiry| expiry <= now_unix)
    }

    /// True when the grant expires within `lead_secs` of `now_unix`. Unknown expiry is never due.
    pub fn expires_within(&self, lead_secs: i64, now_unix: i64) -> bool {
        let Some(expiry) = self.expires_at() else {
            return false;
        };
        expiry.saturating_sub(lead_secs.max(0)) <= now_unix
    }
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::shared::security::mask_token;
        f.debug_struct("AccessGrant")
            .field("access_token", &mask_token(&self.access_token))
            .field("scope", &self.scope)
            .field("refresh_token", &mask_token(&self.refresh_token))
            .field("expires_at", &self.expires_at())
            .finish()
    }
}
