//! Async event fan-out and barrier acknowledgement tracking.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};

use super::lock_ignore_poison;
use crate::protocol::AsyncEvent;
use crate::{Result, RpcError};

/// Stream of async events delivered to one subscriber.
///
/// Created by [`RpcClient::subscribe`](crate::RpcClient::subscribe). Every
/// subscriber sees every event, in the order the client received them.
/// Delivery is unbounded, so a slow subscriber never causes events to be
/// dropped. `recv()` returns `None` once the client is closed.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<AsyncEvent>,
}

impl EventSubscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<AsyncEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<AsyncEvent> {
        self.rx.try_recv().ok()
    }
}

/// Registered subscribers of a client.
pub(super) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AsyncEvent>>>,
}

impl EventBus {
    // ---

    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        lock_ignore_poison(&self.subscribers).push(tx);
        EventSubscription { rx }
    }

    /// Deliver `event` to every live subscriber, evicting dropped ones.
    pub fn dispatch(&self, event: &AsyncEvent) {
        // ---
        lock_ignore_poison(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End every subscription.
    pub fn close(&self) {
        // ---
        lock_ignore_poison(&self.subscribers).clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.subscribers).len()
    }
}

/// Callers waiting for a `trex-barrier` acknowledgement, keyed by barrier key.
pub(super) struct BarrierWaiters {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<()>>>>,
}

impl BarrierWaiters {
    // ---

    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for `key`. A key has at most one waiter at a time.
    pub fn register(&self, key: u64) -> Result<oneshot::Receiver<Result<()>>> {
        // ---
        let mut waiters = lock_ignore_poison(&self.waiters);
        if waiters.contains_key(&key) {
            return Err(RpcError::InvalidArgument(format!("barrier key {key} is already in flight")));
        }

        let (tx, rx) = oneshot::channel();
        waiters.insert(key, tx);
        Ok(rx)
    }

    /// Acknowledge `key`. Returns false when nobody waits for it.
    pub fn acknowledge(&self, key: u64) -> bool {
        // ---
        match lock_ignore_poison(&self.waiters).remove(&key) {
            Some(tx) => tx.send(Ok(())).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, key: u64) {
        lock_ignore_poison(&self.waiters).remove(&key);
    }

    pub fn fail_all(&self, err: impl Fn() -> RpcError) {
        // ---
        let drained: Vec<_> = lock_ignore_poison(&self.waiters).drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(err()));
        }
    }
}
