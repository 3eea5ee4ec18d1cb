//! Usage: Mutex/RwLock extension traits that recover from poisoning instead of panicking.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) trait MutexExt<T> {
    /// Lock the mutex; a poisoned lock is recovered and logged.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    mutex_type = std::any::type_name::<T>(),
                    file = loc.file(),
                    line = loc.line(),
                    column = loc.column(),
                    "mutex poisoned by a panicking thread; recovered data may be inconsistent"
                );
                poisoned.into_inner()
            }
        }
    }
}

pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    #[track_caller]
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            let loc = std::panic::Location::caller();
            tracing::error!(
                lock_type = std::any::type_name::<T>(),
                file = loc.file(),
                line = loc.line(),
                "rwlock poisoned (read); recovered"
            );
            poisoned.into_inner()
        })
    }

    #[track_caller]
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            let loc = std::panic::Location::caller();
            tracing::error!(
                lock_type = std::any::type_name::<T>(),
                file = loc.file(),
                line = loc.line(),
                "rwlock poisoned (write); recovered"
            );
            poisoned.into_inner()
        })
    }
}
