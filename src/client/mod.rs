//! TRex RPC client.
//!
//! [`RpcClient`] correlates requests with responses on the sync channel and
//! fans async events out to [`EventSubscription`]s.

mod batch;
mod events;
mod pending;
mod rpc_client;

use std::sync::{Mutex, MutexGuard};

pub use batch::{Batch, DEFAULT_CHUNK_SIZE};
pub use events::EventSubscription;
pub use rpc_client::{RpcClient, VersionInfo};

/// Acquire a mutex guard, ignoring poisoning.
///
/// Ignoring poisoning is acceptable because:
/// - No lock is held across an `.await` or user code.
/// - The worst outcome is a dropped or unmatched response.
/// - Connection-level failures are handled by the read loop.
///
/// This avoids propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
