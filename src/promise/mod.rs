//! The promise value and its constructors.
//!
//! A [`Promise<T>`] is a cheap, clonable handle over three things: the
//! stage driver (a consume-once closure that arranges the work and
//! eventually invokes a single-shot completion callback), the autorun
//! handle, and the chain's shared [`ChainMonitor`].
//!
//! # Autorun
//!
//! Every constructor schedules the driver to run itself with a no-op
//! completion after a short delay. A promise that is neither chained nor
//! joined therefore still executes its body (fire-and-forget ergonomics).
//! Chain operators, [`Promise::join`], and the aggregators cancel the
//! autorun the moment they attach, and the consume-once driver cell makes
//! the attach/autorun race safe: whichever side takes the driver runs it,
//! the other observes an empty cell.
//!
//! # Chains
//!
//! Chain operators (`then`, `catch`, `finally` and friends) each return a
//! new promise sharing the same monitor, so one `cancel`/`suspend`/
//! `resume` reaches every stage.

mod chain;
mod stage;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

use crate::cancelable::{Cancelable, TaskSlot};
use crate::error::{Error, Result};
use crate::monitor::{ChainMonitor, Complete, PendingGuard};
use crate::scheduler::{self, DelayHandle, QueueId};
use crate::sync::CompletionLatch;

/// Delay before an unchained promise runs itself. Long enough for chain
/// attachment on the constructing thread, short enough to keep
/// fire-and-forget promises prompt.
pub(crate) const AUTORUN_DELAY: Duration = Duration::from_millis(10);

pub(crate) type Driver<T> = Box<dyn FnOnce(Complete<T>) + Send + 'static>;
type DriverCell<T> = Arc<Mutex<Option<Driver<T>>>>;

/// Per-stage scheduling options: target queue, timeout, retries.
///
/// ```
/// use promisync::{QueueId, StageOptions};
/// use std::time::Duration;
///
/// let opts = StageOptions::new()
///     .on(QueueId::Utility)
///     .timeout(Duration::from_millis(500))
///     .retries(2);
/// assert_eq!(opts, StageOptions::new().retries(2).timeout(Duration::from_millis(500)).on(QueueId::Utility));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageOptions {
    queue: Option<QueueId>,
    timeout: Option<Duration>,
    retries: u32,
}

impl StageOptions {
    /// Creates the default options: `Default` queue, no timeout, no
    /// retries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets the stage at a specific pool.
    #[must_use]
    pub fn on(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Arms a timeout against the stage's settlement.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allows up to `retries` re-attempts after a failed attempt
    /// (`retries = 2` means at most three attempts).
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub(crate) fn queue(self) -> QueueId {
        self.queue.unwrap_or(QueueId::Default)
    }

    pub(crate) fn timeout_value(self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn retry_count(self) -> u32 {
        self.retries
    }
}

/// Settlement handle passed to producer bodies.
///
/// `resolve` and `reject` race through the stage's single-shot guard: the
/// first call wins, later calls are dropped silently.
pub struct Completer<T> {
    sink: Arc<dyn Fn(Result<T>) + Send + Sync>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<T: Send + 'static> Completer<T> {
    /// Settles the stage with a value.
    pub fn resolve(&self, value: T) {
        (self.sink)(Ok(value));
    }

    /// Settles the stage with an error.
    pub fn reject(&self, error: Error) {
        (self.sink)(Err(error));
    }

    pub(crate) fn from_guard(guard: &PendingGuard<T>) -> Self {
        let guard = guard.clone();
        Self {
            sink: Arc::new(move |result| {
                guard.settle(result);
            }),
        }
    }

    pub(crate) fn from_latch(latch: Arc<CompletionLatch<Result<T>>>) -> Self {
        Self {
            sink: Arc::new(move |result| {
                latch.settle(result);
            }),
        }
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

/// A chainable, pool-scheduled asynchronous value.
pub struct Promise<T: Send + 'static> {
    driver: DriverCell<T>,
    autorun: DelayHandle,
    monitor: Arc<ChainMonitor>,
}

impl<T: Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            autorun: self.autorun.clone(),
            monitor: Arc::clone(&self.monitor),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("driven", &self.driver.lock().unwrap().is_none())
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Wraps a driver into a promise and schedules its autorun.
    pub(crate) fn from_driver(monitor: Arc<ChainMonitor>, driver: Driver<T>) -> Self {
        let cell: DriverCell<T> = Arc::new(Mutex::new(Some(driver)));
        let autorun = {
            let cell = Arc::clone(&cell);
            scheduler::global().submit_after(
                QueueId::Default,
                AUTORUN_DELAY,
                Box::new(move || {
                    let driver = cell.lock().unwrap().take();
                    if let Some(driver) = driver {
                        trace!("autorun driving unchained promise");
                        driver(Box::new(|_| {}));
                    }
                }),
            )
        };
        Self {
            driver: cell,
            autorun,
            monitor,
        }
    }

    /// Consumes the driver and runs it with `complete`.
    ///
    /// If the autorun already consumed the driver, `complete` receives an
    /// opaque error; in practice the autorun delay makes this unreachable
    /// for chains attached on the constructing thread.
    pub(crate) fn run(&self, complete: Complete<T>) {
        self.cancel_autorun();
        let driver = self.driver.lock().unwrap().take();
        match driver {
            Some(driver) => driver(complete),
            None => complete(Err(Error::user("stage already consumed"))),
        }
    }

    pub(crate) fn cancel_autorun(&self) {
        let _ = self.autorun.cancel();
    }

    /// Returns a handle to the chain's monitor.
    ///
    /// Exposed for lifecycle composition and for leak-detection hooks;
    /// everyday code uses the lifecycle methods on the promise itself.
    #[must_use]
    pub fn monitor_handle(&self) -> Arc<ChainMonitor> {
        Arc::clone(&self.monitor)
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// A promise already settled with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        Self::from_driver(monitor, Box::new(move |complete| complete(Ok(value))))
    }

    /// A promise already settled with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        Self::from_driver(monitor, Box::new(move |complete| complete(Err(error))))
    }

    /// Runs a throwing body on the default queue.
    pub fn spawn(body: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<T> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            scheduler::dispatch(options.queue(), move || {
                stage::run_mapped_once(&driver_monitor, &guard, (), |()| body());
            });
        });
        Self::from_driver(monitor, driver)
    }

    /// Runs a throwing body with explicit queue, timeout, and retries.
    ///
    /// The body is re-invoked once per attempt.
    pub fn spawn_with(
        options: StageOptions,
        body: impl FnMut() -> Result<T> + Send + 'static,
    ) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<T> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            let mut body = body;
            scheduler::dispatch(options.queue(), move || {
                let mut attempt = |(): ()| body();
                stage::run_mapped(
                    &driver_monitor,
                    &guard,
                    options.retry_count(),
                    (),
                    &mut attempt,
                );
            });
        });
        Self::from_driver(monitor, driver)
    }

    /// Runs a callback producer: the body settles the promise through the
    /// [`Completer`] it receives.
    pub fn deferred(body: impl FnOnce(Completer<T>) + Send + 'static) -> Self {
        Self::cancelable(move |completer, _slot| body(completer))
    }

    /// Callback producer with explicit options. The body is re-invoked
    /// with a fresh completer once per attempt.
    pub fn deferred_with(
        options: StageOptions,
        body: impl Fn(Completer<T>) + Send + 'static,
    ) -> Self {
        Self::cancelable_with(options, move |completer, _slot| body(completer))
    }

    /// Runs a producer that may hand a wrapped [`Cancelable`] task to the
    /// chain monitor through the [`TaskSlot`].
    pub fn cancelable(body: impl FnOnce(Completer<T>, &mut TaskSlot) + Send + 'static) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<T> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            scheduler::dispatch(options.queue(), move || {
                stage::run_producer_once(&driver_monitor, &guard, body);
            });
        });
        Self::from_driver(monitor, driver)
    }

    /// Cancelable producer with explicit options. The body is re-invoked
    /// with a fresh completer and slot once per attempt.
    pub fn cancelable_with(
        options: StageOptions,
        body: impl Fn(Completer<T>, &mut TaskSlot) + Send + 'static,
    ) -> Self {
        let monitor = Arc::new(ChainMonitor::new());
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<T> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            scheduler::dispatch(options.queue(), move || {
                stage::run_producer(&driver_monitor, &guard, options.retry_count(), &body);
            });
        });
        Self::from_driver(monitor, driver)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Pauses downstream progression of the chain. In-flight stage bodies
    /// are not interrupted; the wrapped task of the current stage is
    /// suspended.
    pub fn suspend(&self) {
        self.monitor.suspend();
    }

    /// Resumes a suspended chain. A resume without a prior suspend is a
    /// no-op.
    pub fn resume(&self) {
        self.monitor.resume();
    }

    /// Cancels the chain: the current stage's pending settlement becomes
    /// `Cancelled`, its wrapped task is cancelled, and no downstream stage
    /// body starts.
    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    /// Returns true once the chain has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.monitor.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Synchronous wait
    // ------------------------------------------------------------------

    /// Drives the chain and blocks until it settles.
    ///
    /// Must not be called from a worker of a pool the chain needs; that
    /// deadlocks the pool. This is documented, not enforced.
    pub fn join(self) -> Result<T> {
        let latch = Arc::new(CompletionLatch::new());
        {
            let latch = Arc::clone(&latch);
            self.run(Box::new(move |result| {
                latch.settle(result);
            }));
        }
        latch.wait()
    }

    /// Like [`Promise::join`], bounded by `timeout`.
    ///
    /// Returns `None` when the chain does not settle in time; the chain
    /// keeps running.
    pub fn join_timeout(self, timeout: Duration) -> Option<Result<T>> {
        let latch = Arc::new(CompletionLatch::new());
        {
            let latch = Arc::clone(&latch);
            self.run(Box::new(move |result| {
                latch.settle(result);
            }));
        }
        latch.wait_timeout(timeout)
    }
}

impl Promise<()> {
    /// A promise that resolves after `duration`.
    ///
    /// The underlying timer is handed to the monitor as the stage's
    /// wrapped task, so cancelling the chain cancels the dispatch.
    /// The delay is wall-clock; suspension does not stretch it.
    #[must_use]
    pub fn delay(duration: Duration) -> Self {
        Self::cancelable(move |completer, slot| {
            let fire = completer.clone();
            let handle = scheduler::global().submit_after(
                QueueId::Utility,
                duration,
                Box::new(move || fire.resolve(())),
            );
            slot.install(DelayTask { handle });
        })
    }
}

/// Wrapped task of [`Promise::delay`]: cancellation stops the dispatch.
struct DelayTask {
    handle: DelayHandle,
}

impl Cancelable for DelayTask {
    fn suspend(&self) {}

    fn resume(&self) {}

    fn cancel(&self) {
        let _ = self.handle.cancel();
    }
}
