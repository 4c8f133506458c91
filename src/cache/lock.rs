//! Lock access for the registry, the in-memory backend and the in-memory
//! store.
//!
//! A panic while one of these locks is held leaves the table usable: the
//! next caller takes over the last written state and a warning is logged.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| take_over(poisoned, source, op, "read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| take_over(poisoned, source, op, "write"))
}

fn take_over<G>(
    poisoned: PoisonError<G>,
    source: &'static str,
    op: &'static str,
    access: &'static str,
) -> G {
    warn!(
        source,
        op,
        access,
        hint = "entries written by the panicked caller may be partial",
        "Cache table lock poisoned; continuing with last state"
    );
    poisoned.into_inner()
}
