use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Acquire `lock`, recovering the guard if a previous holder panicked.
///
/// Every in-memory structure in the cache keeps plain data behind its mutex,
/// so a poisoned guard is still structurally valid; at worst it holds a
/// half-applied update for one key.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            op,
            owner,
            result = "poisoned_recovered",
            "Recovered from poisoned cache mutex"
        );
        poisoned.into_inner()
    })
}
