//! Cross-thread blocking handoff.
//!
//! A [`SyncWaiter`] is the consumer half of a one-shot slot; the matching
//! [`Resolver`] is the producer half. The consumer blocks until the producer
//! supplies a value, reports a failure, or is dropped without doing either.
//! Dropping an unresolved resolver fails the waiter with
//! [`WaitError::Abandoned`], so a lost message can never strand a caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a wait ended without a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("producer failed: {0}")]
    Failed(String),

    #[error("producer dropped without resolving")]
    Abandoned,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

enum Slot<T> {
    Pending,
    Ready(T),
    Failed(WaitError),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    /// Store an outcome if none is stored yet. Returns false when the slot
    /// was already settled.
    fn settle(&self, outcome: Result<T, WaitError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = match outcome {
            Ok(value) => Slot::Ready(value),
            Err(err) => Slot::Failed(err),
        };
        self.ready.notify_all();
        true
    }
}

/// Create a connected resolver/waiter pair.
pub fn sync_waiter<T>() -> (Resolver<T>, SyncWaiter<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });
    (
        Resolver {
            shared: Some(shared.clone()),
        },
        SyncWaiter { shared },
    )
}

/// Producer half. Resolving consumes it; dropping it unresolved fails the
/// waiter.
pub struct Resolver<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Resolver<T> {
    /// Hand a value to the waiting thread.
    pub fn resolve(mut self, value: T) -> bool {
        match self.shared.take() {
            Some(shared) => shared.settle(Ok(value)),
            None => false,
        }
    }

    /// Wake the waiting thread with a failure.
    pub fn fail(mut self, reason: impl Into<String>) -> bool {
        match self.shared.take() {
            Some(shared) => shared.settle(Err(WaitError::Failed(reason.into()))),
            None => false,
        }
    }

    /// Settle with a full `Result`.
    pub fn complete(self, outcome: Result<T, String>) -> bool {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(reason) => self.fail(reason),
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(WaitError::Abandoned));
        }
    }
}

/// Consumer half.
pub struct SyncWaiter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SyncWaiter<T> {
    /// Block until the resolver settles the slot.
    pub fn wait(self) -> Result<T, WaitError> {
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.shared.ready.wait(&mut slot);
        }
        take(&mut slot)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Pending) {
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out()
                && matches!(*slot, Slot::Pending)
            {
                return Err(WaitError::Timeout(timeout));
            }
        }
        take(&mut slot)
    }

    /// Wait with an optional deadline.
    pub fn wait_for(self, timeout: Option<Duration>) -> Result<T, WaitError> {
        match timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.wait(),
        }
    }

    /// Whether the slot has been settled.
    pub fn is_settled(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending)
    }
}

fn take<T>(slot: &mut Slot<T>) -> Result<T, WaitError> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Ready(value) => Ok(value),
        Slot::Failed(err) => Err(err),
        Slot::Pending | Slot::Taken => Err(WaitError::Abandoned),
    }
}
