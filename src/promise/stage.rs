//! Shared stage execution: gate entry, timeout arming, retry loops.
//!
//! Every stage body funnels through one of the runners here. The shape is
//! always the same: honor the pause gate, re-arm the cancel hook for the
//! running body, attempt the body up to `retries + 1` times, and settle
//! the stage's guard exactly once. Cancellation is never retried and
//! always wins over a pending attempt.

use std::sync::Arc;
use std::time::Duration;

use crate::cancelable::TaskSlot;
use crate::error::{Error, Result};
use crate::monitor::{ChainMonitor, PendingGuard};
use crate::scheduler::{self, QueueId};
use crate::sync::CompletionLatch;

use super::{Completer, Promise};

/// Poll interval while an attempt waits on a latch that may have been
/// obsoleted by a timeout settling the stage.
const ATTEMPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Arms `timeout` against the guard. The timer fires on the utility pool
/// so a busy serial queue cannot starve its own watchdog.
pub(super) fn arm_timeout<T: Send + 'static>(guard: &PendingGuard<T>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else { return };
    let guard = guard.clone();
    let _ = scheduler::global().submit_after(
        QueueId::Utility,
        timeout,
        Box::new(move || {
            guard.settle(Err(Error::timed_out()));
        }),
    );
}

/// Stage entry: blocks on the pause gate, aborts on cancellation, and
/// re-arms the cancel hook so a cancel during the body settles the stage.
fn enter<T: Send + 'static>(monitor: &ChainMonitor, guard: &PendingGuard<T>) -> bool {
    if !monitor.wait() {
        guard.settle(Err(Error::cancelled()));
        return false;
    }
    guard.rearm_cancel_hook();
    true
}

/// Runs a single-attempt synchronous body.
pub(super) fn run_mapped_once<T, U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    input: T,
    body: impl FnOnce(T) -> Result<U>,
) {
    if !enter(monitor, guard) {
        return;
    }
    guard.settle(body(input));
}

/// Runs a synchronous body with retries. The input is re-supplied to each
/// attempt, the last error is forwarded on exhaustion.
pub(super) fn run_mapped<T: Clone, U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    retries: u32,
    input: T,
    body: &mut impl FnMut(T) -> Result<U>,
) {
    if !enter(monitor, guard) {
        return;
    }
    let mut remaining = retries;
    loop {
        match body(input.clone()) {
            Ok(value) => {
                guard.settle(Ok(value));
                return;
            }
            Err(error) => {
                if remaining == 0 {
                    guard.settle(Err(error));
                    return;
                }
                remaining -= 1;
                if guard.is_latched() {
                    // A timeout already settled the stage; stop retrying.
                    return;
                }
                if !monitor.wait() {
                    guard.settle(Err(Error::cancelled()));
                    return;
                }
            }
        }
    }
}

/// Runs a single-attempt error handler.
///
/// Unlike `then` bodies, a handler still runs when the chain is already
/// cancelled: the `Cancelled` error it receives is how user code observes
/// cancellation. Only the pause gate is honored.
pub(super) fn run_handler_once<U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    error: Error,
    handler: impl FnOnce(Error) -> Result<U>,
) {
    let _ = monitor.wait();
    guard.settle(handler(error));
}

/// Runs an error handler with retries. The first invocation always
/// happens (see [`run_handler_once`]); cancellation still breaks the
/// retry loop between attempts.
pub(super) fn run_handler<U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    retries: u32,
    error: Error,
    handler: &mut impl FnMut(Error) -> Result<U>,
) {
    let _ = monitor.wait();
    let mut remaining = retries;
    loop {
        match handler(error.clone()) {
            Ok(value) => {
                guard.settle(Ok(value));
                return;
            }
            Err(rethrown) => {
                if remaining == 0 {
                    guard.settle(Err(rethrown));
                    return;
                }
                remaining -= 1;
                if guard.is_latched() {
                    return;
                }
                if !monitor.wait() {
                    guard.settle(Err(Error::cancelled()));
                    return;
                }
            }
        }
    }
}

/// Runs a single-attempt producer body, wiring its completer straight to
/// the guard and handing any installed task to the monitor.
pub(super) fn run_producer_once<U: Send + 'static>(
    monitor: &Arc<ChainMonitor>,
    guard: &PendingGuard<U>,
    body: impl FnOnce(Completer<U>, &mut TaskSlot),
) {
    if !enter(monitor, guard) {
        return;
    }
    let completer = Completer::from_guard(guard);
    let mut slot = TaskSlot::new();
    body(completer, &mut slot);
    if let Some(task) = slot.take() {
        monitor.install_task(task);
    }
}

/// Runs a producer body with retries.
///
/// Each attempt gets a fresh completer wired to a per-attempt latch; the
/// worker blocks on the latch so the loop can decide between success,
/// retry, and exhaustion. A cancel during an attempt settles the latch
/// (attempt-scoped hook) and breaks the loop; a timeout settles the guard
/// and the abandoned attempt is detected by polling.
pub(super) fn run_producer<U: Send + 'static>(
    monitor: &Arc<ChainMonitor>,
    guard: &PendingGuard<U>,
    retries: u32,
    body: &impl Fn(Completer<U>, &mut TaskSlot),
) {
    if !enter(monitor, guard) {
        return;
    }

    if retries == 0 {
        let completer = Completer::from_guard(guard);
        let mut slot = TaskSlot::new();
        body(completer, &mut slot);
        if let Some(task) = slot.take() {
            monitor.install_task(task);
        }
        return;
    }

    let mut remaining = retries;
    loop {
        let latch = Arc::new(CompletionLatch::new());
        let completer = Completer::from_latch(Arc::clone(&latch));
        let hook = {
            let latch = Arc::clone(&latch);
            monitor.install_on_cancel(Box::new(move || {
                latch.settle(Err(Error::cancelled()));
            }))
        };
        let mut slot = TaskSlot::new();
        body(completer, &mut slot);
        if let Some(task) = slot.take() {
            monitor.install_task(task);
        }

        let outcome = wait_attempt(&latch, guard);
        if let Some(id) = hook {
            monitor.clear_on_cancel(id);
        }
        let Some(result) = outcome else {
            return;
        };

        match result {
            Ok(value) => {
                guard.settle(Ok(value));
                return;
            }
            Err(error) if error.is_cancelled() => {
                guard.settle(Err(error));
                return;
            }
            Err(error) => {
                if remaining == 0 {
                    guard.settle(Err(error));
                    return;
                }
                remaining -= 1;
                if !monitor.wait() {
                    guard.settle(Err(Error::cancelled()));
                    return;
                }
            }
        }
    }
}

/// Adopts a nested promise: drives it and forwards its settlement to the
/// guard. The nested monitor is deliberately not merged with the chain's.
pub(super) fn adopt_inner<U: Send + 'static>(inner: &Promise<U>, guard: &PendingGuard<U>) {
    let guard = guard.clone();
    inner.run(Box::new(move |result| {
        guard.settle(result);
    }));
}

/// Runs a single-attempt nested-promise body.
pub(super) fn run_flat_once<T, U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    input: T,
    body: impl FnOnce(T) -> Promise<U>,
) {
    if !enter(monitor, guard) {
        return;
    }
    let inner = body(input);
    adopt_inner(&inner, guard);
}

/// Runs a nested-promise body with retries: each attempt constructs a
/// fresh nested promise and waits for its settlement.
pub(super) fn run_flat<T: Clone, U: Send + 'static>(
    monitor: &ChainMonitor,
    guard: &PendingGuard<U>,
    retries: u32,
    input: T,
    body: &mut impl FnMut(T) -> Promise<U>,
) {
    if !enter(monitor, guard) {
        return;
    }
    let mut remaining = retries;
    loop {
        let inner = body(input.clone());
        let latch = Arc::new(CompletionLatch::new());
        {
            let latch = Arc::clone(&latch);
            inner.run(Box::new(move |result| {
                latch.settle(result);
            }));
        }

        let Some(result) = wait_attempt(&latch, guard) else {
            return;
        };

        match result {
            Ok(value) => {
                guard.settle(Ok(value));
                return;
            }
            Err(error) if error.is_cancelled() => {
                guard.settle(Err(error));
                return;
            }
            Err(error) => {
                if remaining == 0 {
                    guard.settle(Err(error));
                    return;
                }
                remaining -= 1;
                if !monitor.wait() {
                    guard.settle(Err(Error::cancelled()));
                    return;
                }
            }
        }
    }
}

/// Waits for an attempt latch, abandoning the attempt when the stage's
/// guard was settled behind its back (timeout or cancel-through-guard).
fn wait_attempt<U: Send + 'static>(
    latch: &CompletionLatch<Result<U>>,
    guard: &PendingGuard<U>,
) -> Option<Result<U>> {
    loop {
        if let Some(result) = latch.wait_timeout(ATTEMPT_POLL_INTERVAL) {
            return Some(result);
        }
        if guard.is_latched() {
            return None;
        }
    }
}
