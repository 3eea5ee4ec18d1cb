//! Usage: Process-wide credential store (single current grant + generation counter).
//!
//! Readers take cheap `Arc` snapshots; a replace installs the new grant under the write lock,
//! notifies observers and only then persists it. Observers never see a generation before it is
//! readable through `current()`.

use crate::domain::grant::AccessGrant;
use crate::infra::credential_storage::CredentialStorage;
use crate::shared::error::AppResult;
use crate::shared::mutex_ext::{MutexExt, RwLockExt};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

const INITIAL_GENERATION: u64 = 1;

/// A grant together with the generation it was installed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    pub grant: Arc<AccessGrant>,
    pub generation: u64,
}

/// Notified synchronously after a new grant has been installed.
pub trait GrantObserver: Send + Sync {
    fn on_grant_replaced(&self, snapshot: &CredentialSnapshot);
}

pub struct CredentialStore {
    current: RwLock<CredentialSnapshot>,
    observers: Mutex<Vec<Arc<dyn GrantObserver>>>,
    updates: watch::Sender<CredentialSnapshot>,
    storage: Arc<dyn CredentialStorage>,
    // Highest generation written to storage; older saves that lose a race are skipped.
    persisted_generation: Mutex<u64>,
}

impl CredentialStore {
    pub fn new(initial: AccessGrant, storage: Arc<dyn CredentialStorage>) -> Self {
        let snapshot = CredentialSnapshot {
            grant: Arc::new(initial),
            generation: INITIAL_GENERATION,
        };
        let (updates, _) = watch::channel(snapshot.clone());
        Self {
            current: RwLock::new(snapshot),
            observers: Mutex::new(Vec::new()),
            updates,
            storage,
            persisted_generation: Mutex::new(INITIAL_GENERATION),
        }
    }

    /// Loads the persisted grant when one with an access or refresh token exists, otherwise
    /// builds the initial grant with `factory`.
    pub fn bootstrap(
        storage: Arc<dyn CredentialStorage>,
        factory: impl FnOnce() -> AccessGrant,
    ) -> AppResult<Self> {
        let persisted = storage
            .load()?
            .filter(|g| g.has_access_token() || g.has_refresh_token());
        let initial = match persisted {
            Some(grant) => {
                tracing::info!("credential store loaded persisted grant");
                grant
            }
            None => {
                tracing::info!("no persisted grant; using bootstrap grant");
                factory()
            }
        };
        Ok(Self::new(initial, storage))
    }

    pub fn current(&self) -> CredentialSnapshot {
        self.current.read_or_recover().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.read_or_recover().generation
    }

    /// Installs `grant` as the single source of truth and returns its generation.
    pub fn replace(&self, grant: AccessGrant) -> u64 {
        let snapshot = {
            let mut current = self.current.write_or_recover();
            let next = CredentialSnapshot {
                grant: Arc::new(grant),
                generation: current.generation.saturating_add(1),
            };
            *current = next.clone();
            next
        };
        tracing::info!(generation = snapshot.generation, "access grant replaced");

        self.updates.send_if_modified(|latest| {
            if snapshot.generation > latest.generation {
                *latest = snapshot.clone();
                true
            } else {
                false
            }
        });

        let observers = self.observers.lock_or_recover().clone();
        for observer in observers {
            observer.on_grant_replaced(&snapshot);
        }

        // Storage I/O comes last so rebinding never waits on it.
        self.persist(&snapshot);

        snapshot.generation
    }

    pub fn add_observer(&self, observer: Arc<dyn GrantObserver>) {
        self.observers.lock_or_recover().push(observer);
    }

    /// Async view of the store; the receiver always holds the newest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CredentialSnapshot> {
        self.updates.subscribe()
    }

    fn persist(&self, snapshot: &CredentialSnapshot) {
        let mut persisted = self.persisted_generation.lock_or_recover();
        if snapshot.generation <= *persisted {
            return;
        }
        match self.storage.save(&snapshot.grant) {
            Ok(()) => *persisted = snapshot.generation,
            Err(err) => tracing::warn!(
                generation = snapshot.generation,
                "failed to persist access grant: {}",
                err
            ),
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
