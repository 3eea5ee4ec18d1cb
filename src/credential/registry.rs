//! Usage: Per-request grant bindings and the registry of in-flight authenticated requests.

use super::store::{CredentialSnapshot, CredentialStore, GrantObserver};
use crate::shared::mutex_ext::{MutexExt, RwLockExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct BindingState {
    bound: Option<CredentialSnapshot>,
    last_attempt_generation: Option<u64>,
}

/// The grant a request will send on its next attempt.
///
/// Cloning shares the binding; identity is the `RequestId`, not the request value.
/// A binding only ever moves to a newer generation.
#[derive(Debug, Clone)]
pub struct GrantBinding {
    id: RequestId,
    state: Arc<RwLock<BindingState>>,
}

impl Default for GrantBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl GrantBinding {
    pub fn new() -> Self {
        Self {
            id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            state: Arc::new(RwLock::new(BindingState::default())),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns `false` when `snapshot` is older than what is already bound.
    pub fn bind(&self, snapshot: &CredentialSnapshot) -> bool {
        let mut state = self.state.write_or_recover();
        if state
            .bound
            .as_ref()
            .is_some_and(|b| b.generation >= snapshot.generation)
        {
            return false;
        }
        state.bound = Some(snapshot.clone());
        true
    }

    pub fn current(&self) -> Option<CredentialSnapshot> {
        self.state.read_or_recover().bound.clone()
    }

    /// Reads the bound grant for a network attempt and remembers its generation, so a 401
    /// can later be matched against the grant that was actually sent.
    pub fn begin_attempt(&self) -> Option<CredentialSnapshot> {
        let mut state = self.state.write_or_recover();
        let bound = state.bound.clone()?;
        state.last_attempt_generation = Some(bound.generation);
        Some(bound)
    }

    pub fn last_attempt_generation(&self) -> Option<u64> {
        self.state.read_or_recover().last_attempt_generation
    }
}

/// Every in-flight request that consumes the shared grant. Rebinds all of them when the
/// store installs a new grant.
#[derive(Debug, Default)]
pub struct AuthenticatedRequestRegistry {
    requests: Mutex<HashMap<RequestId, GrantBinding>>,
}

impl AuthenticatedRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the request and binds it to the store's current grant. Returns `None`, leaving the
    /// registry untouched, when the request is already registered.
    ///
    /// The store is read while the registry lock is held, so a concurrent replace either lands
    /// before the read or rebinds the new entry afterwards.
    pub fn register(
        &self,
        binding: &GrantBinding,
        store: &CredentialStore,
    ) -> Option<CredentialSnapshot> {
        let mut requests = self.requests.lock_or_recover();
        if requests.contains_key(&binding.id()) {
            return None;
        }
        requests.insert(binding.id(), binding.clone());
        let snapshot = store.current();
        binding.bind(&snapshot);
        tracing::debug!(
            request = %binding.id(),
            generation = snapshot.generation,
            in_flight = requests.len(),
            "authenticated request registered"
        );
        Some(snapshot)
    }

    /// Idempotent; returns whether the request was still registered.
    pub fn unregister(&self, id: RequestId) -> bool {
        let removed = self.requests.lock_or_recover().remove(&id).is_some();
        if removed {
            tracing::debug!(request = %id, "authenticated request unregistered");
        }
        removed
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.lock_or_recover().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.lock_or_recover().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many bindings moved to `snapshot`.
    pub fn rebind_all(&self, snapshot: &CredentialSnapshot) -> usize {
        let requests = self.requests.lock_or_recover();
        let rebound = requests.values().filter(|b| b.bind(snapshot)).count();
        if rebound > 0 {
            tracing::debug!(
                generation = snapshot.generation,
                rebound,
                "rebound in-flight requests to new grant"
            );
        }
        rebound
    }
}

impl GrantObserver for AuthenticatedRequestRegistry {
    fn on_grant_replaced(&self, snapshot: &CredentialSnapshot) {
        self.rebind_all(snapshot);
    }
}
