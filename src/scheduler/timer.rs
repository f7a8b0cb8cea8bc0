//! Delayed dispatch for the bundled scheduler.
//!
//! A single timer thread owns a min-heap of pending entries ordered by
//! deadline. When the earliest deadline arrives the entry's work is
//! submitted to its target pool, unless the entry's [`DelayHandle`] won
//! the cancellation race first. Cancelled entries are dropped lazily when
//! they reach the top of the heap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::trace;

use super::pool::PoolSet;
use super::{DelayHandle, QueueId, Work};

pub(crate) struct TimerThread {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
    pools: Arc<PoolSet>,
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerEntry {
    deadline: Instant,
    /// Tie-breaker so equal deadlines fire in schedule order.
    seq: u64,
    queue: QueueId,
    work: Work,
    handle: DelayHandle,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TimerThread {
    pub(crate) fn start(pools: Arc<PoolSet>, name_prefix: &str) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            pools,
        });

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name_prefix}-timer"))
                .spawn(move || timer_loop(&shared))
                .expect("failed to spawn timer thread")
        };

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn schedule(&self, queue: QueueId, delay: Duration, work: Work) -> DelayHandle {
        let handle = DelayHandle::new();
        let deadline = Instant::now() + delay;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                // Pools are draining; the dispatch can never fire.
                return handle;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(TimerEntry {
                deadline,
                seq,
                queue,
                work,
                handle: handle.clone(),
            });
        }
        self.condvar_notify();
        handle
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.heap.clear();
        }
        self.condvar_notify();
    }

    pub(crate) fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.handle.lock().unwrap();
        let Some(handle) = slot.take() else {
            return true;
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                *slot = Some(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
        true
    }

    fn condvar_notify(&self) {
        let _guard = self.shared.state.lock().unwrap();
        self.shared.condvar.notify_one();
    }
}

fn timer_loop(shared: &TimerShared) {
    loop {
        let fired = {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown {
                break;
            }

            match state.heap.peek().map(|entry| entry.deadline) {
                None => {
                    let _state = shared.condvar.wait(state).unwrap();
                    None
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let _state = shared
                            .condvar
                            .wait_timeout(state, deadline - now)
                            .unwrap();
                        None
                    } else {
                        state.heap.pop()
                    }
                }
            }
        };

        if let Some(entry) = fired {
            if entry.handle.try_fire() {
                trace!(queue = %entry.queue, "timer fired");
                shared.pools.submit(entry.queue, entry.work);
            } else {
                trace!(queue = %entry.queue, "timer entry cancelled before firing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{PoolConfig, PoolScheduler, Scheduler};
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn scheduler() -> PoolScheduler {
        PoolScheduler::with_config(
            PoolConfig::new()
                .with_concurrent_workers(2)
                .with_thread_name_prefix("timer-test"),
        )
    }

    #[test]
    fn delayed_work_fires_after_delay() {
        let scheduler = scheduler();
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        let start = Instant::now();
        let _handle = scheduler.submit_after(
            QueueId::Default,
            Duration::from_millis(50),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        while counter.load(Ordering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_entry_never_fires() {
        let scheduler = scheduler();
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        let handle = scheduler.submit_after(
            QueueId::Default,
            Duration::from_millis(40),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(handle.cancel());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Same delay, serial target pool: schedule order must survive.
        for n in 0..8 {
            let order = Arc::clone(&order);
            let _ = scheduler.submit_after(
                QueueId::Main,
                Duration::from_millis(30),
                Box::new(move || {
                    order.lock().unwrap().push(n);
                }),
            );
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while order.lock().unwrap().len() < 8 {
            assert!(Instant::now() < deadline, "timers never drained");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_after_fire_reports_loss() {
        let scheduler = scheduler();
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        let handle = scheduler.submit_after(
            QueueId::Default,
            Duration::from_millis(1),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.cancel());
    }
}
