//! Small blocking synchronization pieces shared across the crate.
//!
//! The only primitive here is [`CompletionLatch`], a settle-once slot a
//! thread can block on. It backs `Promise::join`, the per-attempt waits of
//! the retry loop, and nothing else; the pause gate lives inside the chain
//! monitor because it shares the monitor's mutex.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A single-value latch: one writer settles it, any number of readers
/// block until it is settled.
///
/// The first `settle` wins; later settles are dropped. Readers that arrive
/// after settlement return immediately.
#[derive(Debug)]
pub(crate) struct CompletionLatch<T> {
    slot: Mutex<LatchSlot<T>>,
    condvar: Condvar,
}

#[derive(Debug)]
struct LatchSlot<T> {
    value: Option<T>,
    settled: bool,
}

impl<T> CompletionLatch<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(LatchSlot {
                value: None,
                settled: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Settles the latch. Returns false if it was already settled.
    pub(crate) fn settle(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.settled {
            return false;
        }
        slot.value = Some(value);
        slot.settled = true;
        drop(slot);
        self.condvar.notify_all();
        true
    }

    /// Blocks until the latch settles and takes the value.
    ///
    /// At most one caller observes the value; concurrent waiters after the
    /// first receive nothing and must not exist by construction (each latch
    /// has exactly one consumer).
    pub(crate) fn wait(&self) -> T {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            slot = self.condvar.wait(slot).unwrap();
        }
    }

    /// Blocks until the latch settles or the timeout elapses.
    ///
    /// Returns `None` on timeout; the latch remains usable and a later
    /// `wait` still observes the settlement.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _timeout_result) = self.condvar.wait_timeout(slot, remaining).unwrap();
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn settle_then_wait() {
        let latch = CompletionLatch::new();
        assert!(latch.settle(7));
        assert_eq!(latch.wait(), 7);
    }

    #[test]
    fn first_settle_wins() {
        let latch = CompletionLatch::new();
        assert!(latch.settle("first"));
        assert!(!latch.settle("second"));
        assert_eq!(latch.wait(), "first");
    }

    #[test]
    fn wait_blocks_until_settled() {
        let latch = Arc::new(CompletionLatch::new());
        let writer = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                latch.settle(42);
            })
        };
        assert_eq!(latch.wait(), 42);
        writer.join().expect("writer panicked");
    }

    #[test]
    fn wait_timeout_expires() {
        let latch: CompletionLatch<i32> = CompletionLatch::new();
        assert_eq!(latch.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn wait_timeout_then_settle_still_observable() {
        let latch = CompletionLatch::new();
        assert_eq!(latch.wait_timeout(Duration::from_millis(10)), None);
        latch.settle(1);
        assert_eq!(latch.wait_timeout(Duration::from_millis(10)), Some(1));
    }
}
