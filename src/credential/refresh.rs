//! Usage: Single-flight token refresh (`RefreshGate`) and the per-request refresh-aware retry
//! policy (`RefreshCoordinator`).
//!
//! - Any number of requests may fail with 401 at once; the first one launches the refresh, the
//!   others join it and wait on the same outcome.
//! - A 401 from an attempt that used an older generation than the store holds retries
//!   immediately without launching another refresh.

use super::registry::GrantBinding;
use super::store::CredentialStore;
use crate::dispatch::request::RequestListener;
use crate::dispatch::retry::{
    RefreshOutcome, RefreshTicket, RetryDecision, RetryPolicy, RetrySettings,
};
use crate::domain::grant::AccessGrant;
use crate::shared::error::RequestError;
use crate::shared::mutex_ext::MutexExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Submits the refresh exchange as its own job.
///
/// The listener must see the terminal outcome after the new grant has been installed in the
/// store.
pub trait RefreshLauncher: Send + Sync {
    fn launch_refresh(&self, refresh_token: String, listener: Arc<dyn RequestListener<AccessGrant>>);
}

#[derive(Debug)]
struct InFlightRefresh {
    id: u64,
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

#[derive(Debug)]
pub(crate) enum RefreshJoin {
    Started(RefreshTicket),
    Joined(RefreshTicket),
    /// The store already moved past the generation that failed.
    AlreadyRefreshed { generation: u64 },
    /// No refresh token to exchange.
    Unavailable,
}

/// At most one refresh in flight per credential store.
#[derive(Debug, Default)]
pub struct RefreshGate {
    in_flight: Mutex<Option<InFlightRefresh>>,
    next_id: AtomicU64,
    launched: AtomicU64,
}

impl RefreshGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.lock_or_recover().is_some()
    }

    /// Number of refresh exchanges started since creation.
    pub fn refreshes_launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_or_join(
        self: &Arc<Self>,
        store: &Arc<CredentialStore>,
        failed_generation: Option<u64>,
        launcher: &dyn RefreshLauncher,
    ) -> RefreshJoin {
        let mut in_flight = self.in_flight.lock_or_recover();
        if let Some(op) = in_flight.as_ref() {
            tracing::debug!(refresh_id = op.id, "joining in-flight token refresh");
            return RefreshJoin::Joined(RefreshTicket::new(op.outcome.clone()));
        }

        let current = store.current();
        if failed_generation.is_some_and(|failed| current.generation > failed) {
            return RefreshJoin::AlreadyRefreshed {
                generation: current.generation,
            };
        }
        if !current.grant.has_refresh_token() {
            tracing::warn!(
                generation = current.generation,
                "token refresh unavailable: no refresh token"
            );
            return RefreshJoin::Unavailable;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(None);
        *in_flight = Some(InFlightRefresh {
            id,
            outcome: rx.clone(),
        });
        drop(in_flight);

        self.launched.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            refresh_id = id,
            generation = current.generation,
            "token refresh started"
        );

        let completion = Arc::new(RefreshCompletion {
            gate: Arc::clone(self),
            store: Arc::clone(store),
            id,
            outcome: tx,
        });
        launcher.launch_refresh(current.grant.refresh_token().to_string(), completion);

        RefreshJoin::Started(RefreshTicket::new(rx))
    }

    fn finish(&self, id: u64) {
        let mut in_flight = self.in_flight.lock_or_recover();
        if in_flight.as_ref().is_some_and(|op| op.id == id) {
            *in_flight = None;
        }
    }
}

/// Listener attached to the refresh job. Clears the gate before publishing, so a 401 observed
/// after the outcome can start a fresh refresh.
struct RefreshCompletion {
    gate: Arc<RefreshGate>,
    store: Arc<CredentialStore>,
    id: u64,
    outcome: watch::Sender<Option<RefreshOutcome>>,
}

impl RequestListener<AccessGrant> for RefreshCompletion {
    fn on_request_success(&self, _grant: &AccessGrant) {
        let generation = self.store.generation();
        self.gate.finish(self.id);
        tracing::info!(refresh_id = self.id, generation, "token refresh completed");
        self.outcome
            .send_replace(Some(RefreshOutcome::Refreshed { generation }));
    }

    fn on_request_failure(&self, error: &RequestError) {
        self.gate.finish(self.id);
        tracing::warn!(refresh_id = self.id, "token refresh failed: {}", error);
        self.outcome
            .send_replace(Some(RefreshOutcome::Failed(error.clone())));
    }
}

impl Drop for RefreshCompletion {
    // A refresh job that never reported still releases the gate; waiters see a closed channel.
    fn drop(&mut self) {
        self.gate.finish(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Failed,
    RefreshRequested,
    Retrying,
    Abandoned,
}

#[derive(Debug)]
struct CoordinatorState {
    phase: CoordinatorPhase,
    remaining: Option<u32>,
}

/// Retry policy attached to every credential-consuming request.
///
/// Only 401 is retried. The first 401 grants `refresh_retry_budget` attempts, each later
/// failure spends one; a successful refresh caps what is left at `retries_after_refresh`.
pub struct RefreshCoordinator {
    settings: RetrySettings,
    binding: GrantBinding,
    store: Arc<CredentialStore>,
    gate: Arc<RefreshGate>,
    launcher: Weak<dyn RefreshLauncher>,
    state: Mutex<CoordinatorState>,
}

impl RefreshCoordinator {
    pub fn new(
        settings: RetrySettings,
        binding: GrantBinding,
        store: Arc<CredentialStore>,
        gate: Arc<RefreshGate>,
        launcher: Weak<dyn RefreshLauncher>,
    ) -> Self {
        Self {
            settings,
            binding,
            store,
            gate,
            launcher,
            state: Mutex::new(CoordinatorState {
                phase: CoordinatorPhase::Idle,
                remaining: None,
            }),
        }
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.state.lock_or_recover().phase
    }

    /// `None` until the first 401.
    pub fn remaining_attempts(&self) -> Option<u32> {
        self.state.lock_or_recover().remaining
    }

    fn abandon(&self, state: &mut CoordinatorState) -> RetryDecision {
        state.phase = CoordinatorPhase::Abandoned;
        state.remaining = Some(0);
        RetryDecision::abandon()
    }
}

impl RetryPolicy for RefreshCoordinator {
    fn should_retry(&self, error: &RequestError) -> RetryDecision {
        let mut state = self.state.lock_or_recover();
        if state.phase == CoordinatorPhase::Abandoned {
            return RetryDecision::abandon();
        }
        state.phase = CoordinatorPhase::Failed;

        if !error.is_unauthorized() {
            tracing::debug!(
                request = %self.binding.id(),
                code = error.code(),
                "request failed without 401; not retrying"
            );
            return self.abandon(&mut state);
        }

        let remaining = match state.remaining {
            None => self.settings.refresh_retry_budget,
            Some(n) => n.saturating_sub(1),
        };
        state.remaining = Some(remaining);
        if remaining == 0 {
            tracing::debug!(request = %self.binding.id(), "retry budget exhausted after 401");
            return self.abandon(&mut state);
        }

        let Some(launcher) = self.launcher.upgrade() else {
            return self.abandon(&mut state);
        };
        let failed_generation = self.binding.last_attempt_generation();
        match self
            .gate
            .begin_or_join(&self.store, failed_generation, launcher.as_ref())
        {
            RefreshJoin::Started(ticket) | RefreshJoin::Joined(ticket) => {
                state.phase = CoordinatorPhase::RefreshRequested;
                tracing::debug!(
                    request = %self.binding.id(),
                    remaining,
                    "401; waiting on token refresh"
                );
                RetryDecision::wait_for_refresh(ticket, remaining)
            }
            RefreshJoin::AlreadyRefreshed { generation } => {
                // The registry rebind for that grant may still be pending.
                self.binding.bind(&self.store.current());
                state.phase = CoordinatorPhase::Retrying;
                tracing::debug!(
                    request = %self.binding.id(),
                    generation,
                    "401 from stale grant; retrying with current grant"
                );
                RetryDecision::retry_after(self.settings.retry_delay, remaining)
            }
            RefreshJoin::Unavailable => self.abandon(&mut state),
        }
    }

    fn on_refresh_resolved(&self, outcome: &RefreshOutcome) -> RetryDecision {
        let mut state = self.state.lock_or_recover();
        if state.phase == CoordinatorPhase::Abandoned {
            return RetryDecision::abandon();
        }
        match outcome {
            RefreshOutcome::Refreshed { generation } => {
                self.binding.bind(&self.store.current());
                let remaining = state
                    .remaining
                    .unwrap_or(self.settings.refresh_retry_budget)
                    .min(self.settings.retries_after_refresh);
                state.remaining = Some(remaining);
                if remaining == 0 {
                    return self.abandon(&mut state);
                }
                state.phase = CoordinatorPhase::Retrying;
                tracing::debug!(
                    request = %self.binding.id(),
                    generation,
                    remaining,
                    "token refreshed; retrying request"
                );
                RetryDecision::retry_after(self.settings.retry_delay, remaining)
            }
            RefreshOutcome::Failed(err) => {
                tracing::debug!(
                    request = %self.binding.id(),
                    code = err.code(),
                    "token refresh failed; abandoning request"
                );
                self.abandon(&mut state)
            }
        }
    }

    fn on_attempt_start(&self) {
        self.binding.begin_attempt();
    }

    fn on_cancelled(&self) {
        let mut state = self.state.lock_or_recover();
        state.phase = CoordinatorPhase::Abandoned;
        state.remaining = Some(0);
    }
}
