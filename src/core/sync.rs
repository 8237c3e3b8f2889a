//! Lock-poison handling
//!
//! Std locks become poisoned when a holder panics. Instead of propagating the
//! panic with `unwrap()`, callers convert poisoning into their own error type.

use std::sync::{LockResult, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

fn poisoned(kind: &str, detail: impl std::fmt::Debug) -> String {
    format!(
        "Internal synchronisation error ({} poisoned); a task panicked while holding the lock: {:?}",
        kind, detail
    )
}

/// Convert a poisoned `Mutex::lock()` result into an application error
///
/// # Examples
/// ```
/// use std::sync::Mutex;
/// use clusterq::core::sync::handle_mutex_poison;
/// use clusterq::queue::QueueError;
///
/// let offsets = Mutex::new(0u64);
/// let guard = handle_mutex_poison(offsets.lock(), |message| QueueError::Internal { message })
///     .unwrap();
/// assert_eq!(*guard, 0);
/// ```
pub fn handle_mutex_poison<'a, T, E>(
    result: LockResult<MutexGuard<'a, T>>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<MutexGuard<'a, T>, E> {
    result.map_err(|poison_err| error_constructor(poisoned("mutex", poison_err)))
}

/// Convert a poisoned `RwLock::read()` result into an application error
pub fn handle_rwlock_read<'a, T, E>(
    result: LockResult<RwLockReadGuard<'a, T>>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<RwLockReadGuard<'a, T>, E> {
    result.map_err(|poison_err| error_constructor(poisoned("RwLock read", poison_err)))
}

/// Convert a poisoned `RwLock::write()` result into an application error
pub fn handle_rwlock_write<'a, T, E>(
    result: LockResult<RwLockWriteGuard<'a, T>>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<RwLockWriteGuard<'a, T>, E> {
    result.map_err(|poison_err| error_constructor(poisoned("RwLock write", poison_err)))
}
