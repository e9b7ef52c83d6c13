//! Admission control for correlated request/response exchanges.
//!
//! The wire is half-duplex: only one correlated request should be in flight
//! at a time, because the request context describes what the very next
//! non-confirmation frame means. [`TransactionGate`] enforces that with a
//! semaphore; the permit count is configurable for setups willing to trust
//! alpha correlation alone.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-concurrency admission gate for correlated requests.
#[derive(Clone)]
pub struct TransactionGate {
    permits: Arc<Semaphore>,
}

impl TransactionGate {
    /// Create a gate admitting at most `concurrent` exchanges; zero is
    /// treated as one.
    #[must_use]
    pub fn new(concurrent: usize) -> TransactionGate {
        TransactionGate {
            permits: Arc::new(Semaphore::new(concurrent.max(1))),
        }
    }

    /// Wait for admission. The returned transaction holds the slot until it
    /// is dropped, so an exchange that unwinds early (timeout, cancellation)
    /// releases its slot without bookkeeping.
    pub async fn begin(&self) -> Transaction {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("transaction gate semaphore closed");
        Transaction { _permit: permit }
    }
}

/// An admitted exchange; dropping it releases the slot.
pub struct Transaction {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_exchange_waits_for_the_first() {
        let gate = TransactionGate::new(1);
        let first = gate.begin().await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(10), gate.begin());
        assert!(second.await.is_err());
        drop(first);
        let _second = gate.begin().await;
    }

    #[tokio::test]
    async fn gate_supports_wider_admission() {
        let gate = TransactionGate::new(2);
        let _first = gate.begin().await;
        let _second = gate.begin().await;
    }
}
