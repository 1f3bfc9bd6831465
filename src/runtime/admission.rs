//! Counting gate that bounds concurrently active connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Admission slots, one per active connection.
///
/// A slot taken by [`acquire`](Self::acquire) is not tied to a guard: it is
/// handed back explicitly through [`release`](Self::release) when the
/// connection it admitted is torn down. Releases beyond the number of
/// outstanding slots are ignored, so the free count never exceeds capacity.
pub struct AdmissionController {
    slots: Semaphore,
    in_use: AtomicUsize,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Semaphore::new(capacity),
            in_use: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Wait up to `timeout` for a free slot.
    ///
    /// Returns `false` on timeout or once the gate is closed; no slot is
    /// consumed in that case.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::AcqRel);
                true
            }
            Ok(Err(_closed)) => false,
            Err(_elapsed) => false,
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return one slot taken by a successful acquire.
    pub fn release(&self) {
        let taken = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match taken {
            Ok(_) => self.slots.add_permits(1),
            Err(_) => warn!("admission slot released without a matching acquire"),
        }
    }

    /// Fail every pending and future acquire.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let gate = AdmissionController::new(2);

        assert!(gate.acquire(Duration::from_millis(10)).await);
        assert!(gate.acquire(Duration::from_millis(10)).await);
        assert_eq!(gate.in_use(), 2);
        assert_eq!(gate.available(), 0);

        // Full: times out without consuming anything
        assert!(!gate.acquire(Duration::from_millis(20)).await);
        assert_eq!(gate.in_use(), 2);

        gate.release();
        assert_eq!(gate.available(), 1);
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    #[tokio::test]
    async fn test_release_never_exceeds_capacity() {
        let gate = AdmissionController::new(1);
        assert!(gate.try_acquire());

        gate.release();
        gate.release();
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let gate = Arc::new(AdmissionController::new(1));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.release();

        assert!(waiter.await.unwrap());
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_acquire() {
        let gate = Arc::new(AdmissionController::new(1));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();

        assert!(!waiter.await.unwrap());
    }
}
