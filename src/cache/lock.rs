//! Poison-tolerant lock acquisition.
//!
//! A panic inside a subscriber or loader must not take the whole data layer
//! down with it, so poisoned guards are recovered and logged.

use std::sync::{
    LockResult, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned: PoisonError<G>| {
        warn!(
            op,
            target_module = target,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned lock; state may reflect a half-applied update"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), target, op, "mutex.lock")
}
