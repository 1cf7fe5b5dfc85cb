//! Test support.
//!
//! The event channels, status cells and scheduler are process-wide
//! statics; tests that touch them serialize on this lock so the harness
//! can still run everything else in parallel.

use std::sync::{Mutex, MutexGuard, PoisonError};

static LOCK: Mutex<()> = Mutex::new(());

pub fn global_lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}
