use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation ID for matching responses to requests.
///
/// JSON-RPC ids on the TRex wire are plain integers. The client issues them
/// from a per-connection [`CorrelationIdGen`], so an id is unique among the
/// requests in flight on that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    // ---

    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw integer id.
    pub fn get(self) -> u64 {
        // ---
        self.0
    }
}

impl fmt::Display for CorrelationId {
    // ---

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    // ---

    fn from(id: u64) -> Self {
        // ---
        Self(id)
    }
}

/// Monotonic id source, starting at 1.
#[derive(Debug)]
pub struct CorrelationIdGen {
    next: AtomicU64,
}

impl CorrelationIdGen {
    // ---

    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next id.
    pub fn generate(&self) -> CorrelationId {
        // ---
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CorrelationIdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generate_starts_at_one() {
        // ---
        let ids = CorrelationIdGen::new();
        assert_eq!(ids.generate().get(), 1);
        assert_eq!(ids.generate().get(), 2);
    }

    #[test]
    fn test_generate_unique_across_threads() {
        // ---
        let ids = Arc::new(CorrelationIdGen::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.generate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_serializes_as_integer() {
        // ---
        let id = CorrelationId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(id.to_string(), "42");
    }
}
