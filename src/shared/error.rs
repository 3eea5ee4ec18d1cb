//! Usage: Unified error model: `AppError` for setup/storage failures (`CODE: message`) and
//! `RequestError` for the outcome of a dispatched request.

use std::sync::Arc;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    code: String,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn split_code_message(raw: &str) -> Option<(&str, &str)> {
    let msg = raw.trim();
    let msg = msg.strip_prefix("Error:").unwrap_or(msg).trim();
    if msg.is_empty() {
        return None;
    }

    let (maybe_code, rest) = msg.split_once(':')?;
    let code = maybe_code.trim();
    if code.is_empty() {
        return None;
    }
    let mut chars = code.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_') {
        return None;
    }
    Some((code, rest.trim()))
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        if let Some((code, rest)) = split_code_message(&value) {
            let message = if rest.is_empty() { value.trim() } else { rest };
            return AppError::new(code.to_string(), message.to_string());
        }
        AppError::new("INTERNAL_ERROR", value)
    }
}

impl From<&'static str> for AppError {
    fn from(value: &'static str) -> Self {
        AppError::from(value.to_string())
    }
}

impl From<RequestError> for AppError {
    fn from(value: RequestError) -> Self {
        let display = value.to_string();
        let message = display
            .split_once(": ")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| display.clone());
        AppError::with_source(value.code(), message, value)
    }
}

macro_rules! db_err {
    ($($arg:tt)*) => {
        $crate::shared::error::AppError::new("DB_ERROR", format!($($arg)*))
    };
}
pub(crate) use db_err;

/// Terminal or retryable failure of one network attempt.
///
/// `Clone` because the same failure is handed to every listener of a request and to every
/// request waiting on a shared refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// HTTP 401. The only failure that may trigger a token refresh.
    #[error("AUTH_UNAUTHORIZED: upstream returned status=401 body={body}")]
    Unauthorized { body: String },
    #[error("HTTP_STATUS_ERROR: upstream returned status={status} body={body}")]
    Http { status: u16, body: String },
    #[error("REQUEST_CANCELLED: request was cancelled")]
    Cancelled,
    /// The same request is still in flight from an earlier submission.
    #[error("REQUEST_ALREADY_ACTIVE: request is already in flight")]
    AlreadyActive,
    #[error("TRANSPORT_ERROR: {0}")]
    Transport(String),
    #[error("INVALID_RESPONSE: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// Maps a non-2xx status to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 401 {
            Self::Unauthorized { body }
        } else {
            Self::Http { status, body }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { .. } => Some(401),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "AUTH_UNAUTHORIZED",
            Self::Http { .. } => "HTTP_STATUS_ERROR",
            Self::Cancelled => "REQUEST_CANCELLED",
            Self::AlreadyActive => "REQUEST_ALREADY_ACTIVE",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }
}
