//! Shared helpers: configuration loading, logging, and lock access.

pub mod config;
pub mod logging;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A writer that panicked mid-update leaves plain data behind; readers keep going.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
