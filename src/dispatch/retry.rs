//! Usage: Retry policy contract between the executor and per-request retry logic.

use crate::shared::error::RequestError;
use std::time::Duration;
use tokio::sync::watch;

/// Knobs for the refresh-aware retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts granted to a request on its first 401.
    pub refresh_retry_budget: u32,
    /// Attempts left to a request once the refresh it waited on succeeds.
    pub retries_after_refresh: u32,
    /// Pause before re-executing after a successful refresh.
    pub retry_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            refresh_retry_budget: 3,
            retries_after_refresh: 1,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Terminal result of a token refresh, shared with every request that waited on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The new grant is installed in the store at `generation`.
    Refreshed { generation: u64 },
    Failed(RequestError),
}

impl RefreshOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }
}

/// Wait handle for an in-flight refresh. Any number of requests may hold one.
#[derive(Debug, Clone)]
pub struct RefreshTicket {
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

impl RefreshTicket {
    pub(crate) fn new(outcome: watch::Receiver<Option<RefreshOutcome>>) -> Self {
        Self { outcome }
    }

    /// Completes once the refresh reaches a terminal outcome.
    pub async fn resolved(mut self) -> RefreshOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(resolved) => resolved.clone(),
                None => abandoned_refresh(),
            },
            Err(_) => abandoned_refresh(),
        }
    }
}

fn abandoned_refresh() -> RefreshOutcome {
    RefreshOutcome::Failed(RequestError::Transport(
        "token refresh ended without an outcome".to_string(),
    ))
}

#[derive(Debug, Clone)]
pub enum RetryAction {
    Abandon,
    /// Re-execute after the delay (zero means immediately).
    RetryAfterDelay(Duration),
    /// Hold the request until the refresh resolves, then ask the policy again.
    RetryPendingRefresh(RefreshTicket),
}

#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub remaining_attempts: u32,
}

impl RetryDecision {
    pub fn abandon() -> Self {
        Self {
            action: RetryAction::Abandon,
            remaining_attempts: 0,
        }
    }

    pub fn retry_after(delay: Duration, remaining_attempts: u32) -> Self {
        Self {
            action: RetryAction::RetryAfterDelay(delay),
            remaining_attempts,
        }
    }

    pub fn wait_for_refresh(ticket: RefreshTicket, remaining_attempts: u32) -> Self {
        Self {
            action: RetryAction::RetryPendingRefresh(ticket),
            remaining_attempts,
        }
    }

    pub fn is_abandon(&self) -> bool {
        self.remaining_attempts == 0 || matches!(self.action, RetryAction::Abandon)
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self.action {
            _ if self.remaining_attempts == 0 => "abandon",
            RetryAction::Abandon => "abandon",
            RetryAction::RetryAfterDelay(_) => "retry",
            RetryAction::RetryPendingRefresh(_) => "wait-for-refresh",
        }
    }
}

/// Decides what the executor does after a failed attempt.
///
/// Policies are per request; the executor never shares one between submissions.
pub trait RetryPolicy: Send + Sync {
    /// Called right before every network attempt.
    fn on_attempt_start(&self) {}

    fn should_retry(&self, error: &RequestError) -> RetryDecision;

    /// Called after a `RetryPendingRefresh` ticket resolves.
    fn on_refresh_resolved(&self, _outcome: &RefreshOutcome) -> RetryDecision {
        RetryDecision::abandon()
    }

    fn on_cancelled(&self) {}
}
