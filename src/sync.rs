use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Critical sections in this crate never leave shared state half-written
/// across a panic point, so the inner value is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
