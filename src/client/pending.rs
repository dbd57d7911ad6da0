use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use super::lock_ignore_poison;
use crate::protocol::CorrelationId;
use crate::{Result, RpcError};

/// Messages remembered in send order.
const MAX_SENT: usize = 4096;

/// Outcome delivered to a waiting call.
pub(super) type CallOutcome = Result<Value>;

/// Tracks pending requests waiting for responses.
///
/// Maps correlation IDs to oneshot channels. Callers register entries; the
/// read loop completes them. Once [`fail_all`](Self::fail_all) has run the
/// map is closed and further registrations fail with `Cancelled`.
///
/// The ids of every sent message are also kept in send order. The server
/// answers one peer in order, so a reply that names no id belongs to the
/// oldest message still waiting (see [`fail_oldest`](Self::fail_oldest)).
pub(super) struct PendingRequests {
    // ---
    state: Mutex<State>,
}

struct State {
    requests: HashMap<CorrelationId, oneshot::Sender<CallOutcome>>,
    sent: VecDeque<Vec<CorrelationId>>,
    closed: bool,
}

impl PendingRequests {
    // ---

    /// Create a new empty pending requests tracker
    pub fn new() -> Self {
        // ---
        Self {
            state: Mutex::new(State {
                requests: HashMap::new(),
                sent: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Register a new pending request
    ///
    /// Returns a receiver that will be notified when the response arrives.
    pub fn register(&self, correlation_id: CorrelationId) -> Result<oneshot::Receiver<CallOutcome>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return Err(RpcError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        state.requests.insert(correlation_id, tx);
        Ok(rx)
    }

    /// Record one outgoing message carrying `ids`, in send order.
    ///
    /// Entries stay until a later message is answered, even when their
    /// caller gave up, so a late reply to an abandoned message does not hit
    /// the next caller.
    pub fn mark_sent(&self, ids: Vec<CorrelationId>) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.closed {
            return;
        }
        if state.sent.len() == MAX_SENT {
            state.sent.pop_front();
        }
        state.sent.push_back(ids);
    }

    /// Forget a message that never left the client.
    pub fn withdraw(&self, ids: &[CorrelationId]) {
        // ---
        lock_ignore_poison(&self.state).sent.retain(|sent| sent.as_slice() != ids);
    }

    /// Complete a pending request with its outcome
    ///
    /// Returns true if the correlation_id was found and the outcome was delivered.
    /// Messages sent before the one carrying `correlation_id` are answered
    /// already and leave the send order.
    pub fn complete(&self, correlation_id: CorrelationId, outcome: CallOutcome) -> bool {
        // ---
        let tx = {
            let mut state = lock_ignore_poison(&self.state);
            if let Some(pos) = state.sent.iter().position(|ids| ids.contains(&correlation_id)) {
                state.sent.drain(..=pos);
            }
            state.requests.remove(&correlation_id)
        };

        match tx {
            // A send error means the caller gave up between lookup and delivery.
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove a pending request without delivering a response
    ///
    /// Used by the caller's own cleanup after a timeout.
    pub fn remove(&self, correlation_id: CorrelationId) -> bool {
        // ---
        lock_ignore_poison(&self.state)
            .requests
            .remove(&correlation_id)
            .is_some()
    }

    /// Fail the waiting requests of the oldest unanswered message.
    ///
    /// Used for replies that cannot be attributed by id. Returns the number
    /// of requests failed, zero when that message has no caller left.
    pub fn fail_oldest(&self, err: impl Fn() -> RpcError) -> usize {
        // ---
        let senders: Vec<_> = {
            let mut state = lock_ignore_poison(&self.state);
            match state.sent.pop_front() {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| state.requests.remove(id))
                    .collect(),
                None => Vec::new(),
            }
        };

        let count = senders.len();
        for tx in senders {
            let _ = tx.send(Err(err()));
        }
        count
    }

    /// Fail every pending request and close the map.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, err: impl Fn() -> RpcError) -> usize {
        // ---
        let drained: Vec<_> = {
            let mut state = lock_ignore_poison(&self.state);
            state.closed = true;
            state.sent.clear();
            state.requests.drain().collect()
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err()));
        }
        count
    }

    /// Get the number of pending requests
    pub fn len(&self) -> usize {
        // ---
        lock_ignore_poison(&self.state).requests.len()
    }
}

/// Removes the caller's entries when the call finishes or is abandoned.
pub(super) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    ids: Vec<CorrelationId>,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests) -> Self {
        Self {
            pending,
            ids: Vec::new(),
        }
    }

    /// Register `correlation_id` and track it for cleanup.
    pub fn register(&mut self, correlation_id: CorrelationId) -> Result<oneshot::Receiver<CallOutcome>> {
        // ---
        let rx = self.pending.register(correlation_id)?;
        self.ids.push(correlation_id);
        Ok(rx)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // ---
        for id in self.ids.drain(..) {
            self.pending.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> CorrelationId {
        CorrelationId::new(raw)
    }

    #[test]
    fn test_register_and_complete() {
        // ---
        let pending = PendingRequests::new();

        let rx = pending.register(id(1)).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(id(1), Ok(json!({"version": "v3.02"}))));

        // Should be removed after completion
        assert_eq!(pending.len(), 0);

        // Receiver should get the response
        let received = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(received, json!({"version": "v3.02"}));
    }

    #[test]
    fn test_remove() {
        // ---
        let pending = PendingRequests::new();

        let _rx = pending.register(id(1)).unwrap();
        assert!(pending.remove(id(1)));
        assert_eq!(pending.len(), 0);

        // Second remove should return false
        assert!(!pending.remove(id(1)));
    }

    #[test]
    fn test_complete_unknown_id() {
        // ---
        let pending = PendingRequests::new();
        assert!(!pending.complete(id(9), Ok(Value::Null)));
    }

    #[test]
    fn test_fail_all_closes() {
        // ---
        let pending = PendingRequests::new();
        let receivers: Vec<_> = (1..=3).map(|n| pending.register(id(n)).unwrap()).collect();

        assert_eq!(pending.fail_all(|| RpcError::Cancelled), 3);
        assert_eq!(pending.len(), 0);

        for rx in receivers {
            assert!(matches!(rx.blocking_recv().unwrap(), Err(RpcError::Cancelled)));
        }
        assert!(matches!(pending.register(id(4)), Err(RpcError::Cancelled)));
    }

    #[test]
    fn test_fail_oldest_follows_send_order() {
        // ---
        let pending = PendingRequests::new();
        let first = pending.register(id(1)).unwrap();
        pending.mark_sent(vec![id(1)]);
        let batch: Vec<_> = [2, 3].iter().map(|&n| pending.register(id(n)).unwrap()).collect();
        pending.mark_sent(vec![id(2), id(3)]);

        assert_eq!(pending.fail_oldest(|| RpcError::Protocol("garbage".into())), 1);
        assert!(matches!(first.blocking_recv().unwrap(), Err(RpcError::Protocol(_))));

        assert_eq!(pending.fail_oldest(|| RpcError::Protocol("garbage".into())), 2);
        for rx in batch {
            assert!(matches!(rx.blocking_recv().unwrap(), Err(RpcError::Protocol(_))));
        }
        assert_eq!(pending.fail_oldest(|| RpcError::Cancelled), 0);
    }

    #[test]
    fn test_late_reply_to_abandoned_message_spares_next_caller() {
        // ---
        let pending = PendingRequests::new();
        for n in 1..=3 {
            let _rx = pending.register(id(n)).unwrap();
            pending.mark_sent(vec![id(n)]);
        }
        let waiting = pending.register(id(4)).unwrap();
        pending.mark_sent(vec![id(4)]);

        // 1 timed out, 2 answered, 3 abandoned
        pending.remove(id(1));
        pending.complete(id(2), Ok(Value::Null));
        pending.remove(id(3));

        // the garbage reply belongs to 3
        assert_eq!(pending.fail_oldest(|| RpcError::Protocol("garbage".into())), 0);
        assert_eq!(pending.len(), 1);

        assert_eq!(pending.fail_oldest(|| RpcError::Protocol("garbage".into())), 1);
        assert!(matches!(waiting.blocking_recv().unwrap(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_guard_cleans_up() {
        // ---
        let pending = PendingRequests::new();
        {
            let mut guard = PendingGuard::new(&pending);
            let _a = guard.register(id(1)).unwrap();
            let _b = guard.register(id(2)).unwrap();
            assert_eq!(pending.len(), 2);
        }
        assert_eq!(pending.len(), 0);
    }
}
