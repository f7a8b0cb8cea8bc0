//! Chain monitors and single-shot settlement guards.
//!
//! A [`ChainMonitor`] is the lifecycle controller shared by every stage of
//! one promise chain. It owns the cancellation flag, the pause gate, the
//! at-most-one cancel hook, and the slot for the wrapped [`Cancelable`]
//! task of whichever stage is currently in flight.
//!
//! # Ordering Contracts
//!
//! - **CANCEL-MONO**: `cancelled` transitions false→true exactly once and
//!   never back.
//! - **HOOK-RACE**: `install_on_cancel` after `cancel` fires the hook
//!   synchronously, so between the two calls the hook fires exactly once.
//! - **TASK-REPLAY**: `install_task` after `suspend` or `cancel` replays
//!   that signal onto the new task immediately.
//! - **GATE-DOMINANCE**: `resume` after `cancel` is a gate no-op;
//!   `wait` never returns ok once cancellation is observable.
//!
//! Hook and task invocations always happen outside the monitor mutex; a
//! hook may re-enter the monitor (settlement clears hook storage).

use std::sync::{Arc, Condvar, Mutex};
use tracing::trace;

use crate::cancelable::Cancelable;
use crate::error::{Error, Result};

/// Identifies one `install_on_cancel` call, so a stage clears only its own
/// installation and never a successor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

type Hook = Box<dyn FnOnce() + Send>;

/// Per-chain lifecycle controller.
pub struct ChainMonitor {
    state: Mutex<MonitorState>,
    gate: Condvar,
}

struct MonitorState {
    cancelled: bool,
    paused: bool,
    hook: Option<(HookId, Hook)>,
    next_hook_id: u64,
    task: Option<Arc<dyn Cancelable>>,
    on_deinit: Option<Hook>,
}

impl ChainMonitor {
    /// Creates a fresh monitor: not cancelled, not paused, nothing
    /// installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                cancelled: false,
                paused: false,
                hook: None,
                next_hook_id: 0,
                task: None,
                on_deinit: None,
            }),
            gate: Condvar::new(),
        }
    }

    /// Installs the pause gate and suspends the wrapped task. Idempotent;
    /// a no-op once cancelled.
    pub fn suspend(&self) {
        let task = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled || state.paused {
                return;
            }
            state.paused = true;
            state.task.clone()
        };
        trace!("chain suspended");
        if let Some(task) = task {
            task.suspend();
        }
    }

    /// Releases the pause gate and resumes the wrapped task. A resume not
    /// paired with a prior suspend is a complete no-op.
    pub fn resume(&self) {
        let task = {
            let mut state = self.state.lock().unwrap();
            if !state.paused {
                return;
            }
            state.paused = false;
            state.task.clone()
        };
        self.gate.notify_all();
        trace!("chain resumed");
        if let Some(task) = task {
            task.resume();
        }
    }

    /// Cancels the chain: sets the flag, fires the installed hook, cancels
    /// the wrapped task, and wakes every gate waiter. Idempotent.
    pub fn cancel(&self) {
        let (hook, task) = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.paused = false;
            (state.hook.take(), state.task.take())
        };
        self.gate.notify_all();
        trace!("chain cancelled");
        if let Some((_, hook)) = hook {
            hook();
        }
        if let Some(task) = task {
            task.cancel();
        }
    }

    /// Blocks while the pause gate is present.
    ///
    /// Returns false when cancellation is observed on entry or on wake;
    /// true otherwise. This is the only blocking point between stages.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return false;
        }
        while state.paused {
            state = self.gate.wait(state).unwrap();
            if state.cancelled {
                return false;
            }
        }
        true
    }

    /// Returns true once the chain has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Returns true while the pause gate is present.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// Installs the cancel hook, replacing any previous installation.
    ///
    /// If the chain is already cancelled the hook fires synchronously and
    /// `None` is returned; otherwise the returned id names this
    /// installation for [`ChainMonitor::clear_on_cancel`].
    pub fn install_on_cancel(&self, hook: Hook) -> Option<HookId> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            drop(state);
            hook();
            return None;
        }
        state.next_hook_id += 1;
        let id = HookId(state.next_hook_id);
        state.hook = Some((id, hook));
        Some(id)
    }

    /// Removes the cancel hook if `id` still names the installed one.
    pub fn clear_on_cancel(&self, id: HookId) {
        let mut state = self.state.lock().unwrap();
        if state.hook.as_ref().map(|(installed, _)| *installed) == Some(id) {
            state.hook = None;
        }
    }

    /// Installs the wrapped task for the current stage, replacing any
    /// previous one. A pending suspend or cancel is replayed onto the new
    /// task immediately.
    pub fn install_task(&self, task: Arc<dyn Cancelable>) {
        let (cancelled, paused) = {
            let mut state = self.state.lock().unwrap();
            if !state.cancelled {
                state.task = Some(Arc::clone(&task));
            }
            (state.cancelled, state.paused)
        };
        if cancelled {
            task.cancel();
        } else if paused {
            task.suspend();
        }
    }

    /// Installs a hook fired exactly once when the monitor is dropped.
    /// The leak-detection seam for chains that end in an unobserved error.
    pub fn install_on_deinit(&self, hook: Hook) {
        self.state.lock().unwrap().on_deinit = Some(hook);
    }
}

impl Default for ChainMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChainMonitor {
    fn drop(&mut self) {
        let hook = match self.state.get_mut() {
            Ok(state) => state.on_deinit.take(),
            Err(poisoned) => poisoned.into_inner().on_deinit.take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Cancelable for ChainMonitor {
    fn suspend(&self) {
        Self::suspend(self);
    }

    fn resume(&self) {
        Self::resume(self);
    }

    fn cancel(&self) {
        Self::cancel(self);
    }
}

impl std::fmt::Debug for ChainMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ChainMonitor")
            .field("cancelled", &state.cancelled)
            .field("paused", &state.paused)
            .field("hook", &state.hook.is_some())
            .field("task", &state.task.is_some())
            .finish()
    }
}

/// The completion callback a driver hands downstream.
pub(crate) type Complete<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Single-shot wrapper around a stage's completion callback.
///
/// The first [`PendingGuard::settle`] latches and forwards; later settles
/// are dropped silently. Arming installs the monitor's cancel hook so
/// cancellation is always a competitor in the settlement race, and
/// latching clears that installation so the monitor holds no closure for
/// a finished stage.
pub(crate) struct PendingGuard<T> {
    inner: Arc<GuardInner<T>>,
}

impl<T> Clone for PendingGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct GuardInner<T> {
    monitor: Arc<ChainMonitor>,
    latch: Mutex<GuardLatch<T>>,
}

struct GuardLatch<T> {
    latched: bool,
    complete: Option<Complete<T>>,
    hook: Option<HookId>,
}

impl<T: Send + 'static> PendingGuard<T> {
    /// Wraps `complete` and arms the monitor's cancel hook.
    pub(crate) fn arm(monitor: Arc<ChainMonitor>, complete: Complete<T>) -> Self {
        let guard = Self {
            inner: Arc::new(GuardInner {
                monitor,
                latch: Mutex::new(GuardLatch {
                    latched: false,
                    complete: Some(complete),
                    hook: None,
                }),
            }),
        };
        guard.rearm_cancel_hook();
        guard
    }

    /// Re-installs the cancel hook for this guard.
    ///
    /// Stage bodies call this at body entry so a cancellation arriving
    /// while an asynchronous body is in flight still settles the stage.
    pub(crate) fn rearm_cancel_hook(&self) {
        let hook_target = self.clone();
        let installed = self.inner.monitor.install_on_cancel(Box::new(move || {
            hook_target.settle(Err(Error::cancelled()));
        }));
        if let Some(id) = installed {
            self.inner.latch.lock().unwrap().hook = Some(id);
        }
    }

    /// Forwards `result` downstream if this guard has not latched yet.
    /// Returns false when a previous settlement won.
    pub(crate) fn settle(&self, result: Result<T>) -> bool {
        let (complete, hook) = {
            let mut latch = self.inner.latch.lock().unwrap();
            if latch.latched {
                trace!("late settlement dropped");
                return false;
            }
            latch.latched = true;
            (latch.complete.take(), latch.hook.take())
        };
        if let Some(id) = hook {
            self.inner.monitor.clear_on_cancel(id);
        }
        if let Some(complete) = complete {
            complete(result);
        }
        true
    }

    /// Returns true once a settlement has latched.
    pub(crate) fn is_latched(&self) -> bool {
        self.inner.latch.lock().unwrap().latched
    }

    pub(crate) fn monitor(&self) -> &Arc<ChainMonitor> {
        &self.inner.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct CountingTask {
        suspends: AtomicUsize,
        resumes: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl CountingTask {
        fn new() -> Self {
            Self {
                suspends: AtomicUsize::new(0),
                resumes: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
            }
        }
    }

    impl Cancelable for CountingTask {
        fn suspend(&self) {
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let monitor = ChainMonitor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        monitor.install_on_cancel(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.cancel();
        monitor.cancel();

        assert!(monitor.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_after_cancel_fires_synchronously() {
        let monitor = ChainMonitor::new();
        monitor.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = monitor.install_on_cancel(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(id.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspend_then_install_task_replays_suspend() {
        let monitor = ChainMonitor::new();
        monitor.suspend();

        let task = Arc::new(CountingTask::new());
        monitor.install_task(task.clone());

        assert_eq!(task.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(task.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_then_install_task_replays_cancel() {
        let monitor = ChainMonitor::new();
        monitor.cancel();

        let task = Arc::new(CountingTask::new());
        monitor.install_task(task.clone());

        assert_eq!(task.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(task.suspends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn suspend_is_idempotent_and_forwards_once() {
        let monitor = ChainMonitor::new();
        let task = Arc::new(CountingTask::new());
        monitor.install_task(task.clone());

        monitor.suspend();
        monitor.suspend();
        assert_eq!(task.suspends.load(Ordering::SeqCst), 1);

        monitor.resume();
        monitor.resume();
        assert_eq!(task.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unpaired_resume_is_a_no_op() {
        let monitor = ChainMonitor::new();
        let task = Arc::new(CountingTask::new());
        monitor.install_task(task.clone());

        monitor.resume();
        assert_eq!(task.resumes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_blocks_until_resume() {
        let monitor = Arc::new(ChainMonitor::new());
        monitor.suspend();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.wait())
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        monitor.resume();
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn wait_reports_cancel_on_wake() {
        let monitor = Arc::new(ChainMonitor::new());
        monitor.suspend();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.wait())
        };

        thread::sleep(Duration::from_millis(30));
        monitor.cancel();
        assert!(!waiter.join().expect("waiter panicked"));

        // And once cancelled, wait fails on entry.
        assert!(!monitor.wait());
    }

    #[test]
    fn clear_on_cancel_is_epoch_checked() {
        let monitor = ChainMonitor::new();

        let first = monitor
            .install_on_cancel(Box::new(|| {}))
            .expect("not cancelled");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let _second = monitor
            .install_on_cancel(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("not cancelled");

        // Clearing a stale id must not remove the newer hook.
        monitor.clear_on_cancel(first);
        monitor.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deinit_hook_fires_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let monitor = ChainMonitor::new();
            let f = Arc::clone(&fired);
            monitor.install_on_deinit(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_latches_exactly_once() {
        let monitor = Arc::new(ChainMonitor::new());
        let results = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&results);
        let guard = PendingGuard::arm(
            monitor,
            Box::new(move |result: Result<i32>| {
                r.lock().unwrap().push(result);
            }),
        );

        assert!(guard.settle(Ok(1)));
        assert!(!guard.settle(Ok(2)));
        assert!(!guard.settle(Err(Error::cancelled())));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(*results[0].as_ref().expect("settled err"), 1);
    }

    #[test]
    fn cancel_settles_armed_guard_with_cancelled() {
        let monitor = Arc::new(ChainMonitor::new());
        let results = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&results);
        let guard = PendingGuard::arm(
            Arc::clone(&monitor),
            Box::new(move |result: Result<i32>| {
                r.lock().unwrap().push(result);
            }),
        );

        monitor.cancel();
        assert!(guard.is_latched());
        assert!(!guard.settle(Ok(9)));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().expect_err("settled ok").is_cancelled());
    }

    #[test]
    fn latching_clears_the_cancel_hook() {
        let monitor = Arc::new(ChainMonitor::new());
        let guard = PendingGuard::arm(Arc::clone(&monitor), Box::new(|_: Result<i32>| {}));

        assert!(guard.settle(Ok(1)));
        // The hook slot is free again: cancel fires nothing settled by the
        // guard, and a later install observes an empty slot.
        monitor.cancel();
        assert!(guard.monitor().is_cancelled());
    }
}
