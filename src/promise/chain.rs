//! Chain operators: `then`, `catch`, `finally` and their variants.
//!
//! Each operator cancels the predecessor's autorun, composes the
//! predecessor's driver with the stage body, and returns a new promise
//! sharing the same monitor. Settlement flows forward through a
//! single-shot guard per stage; an error in flight bypasses `then` bodies
//! without invoking them and is delivered to the earliest `catch`.
//!
//! Operator variants and their body shapes:
//!
//! | operator               | body                                   |
//! |------------------------|----------------------------------------|
//! | `then`                 | `FnOnce(T) -> Result<U>`               |
//! | `then_with`            | `FnMut(T) -> Result<U>` (retryable)    |
//! | `then_flat[_with]`     | `T -> Promise<U>` (nested adoption)    |
//! | `then_async[_with]`    | `(T, Completer<U>)` producer           |
//! | `then_cancelable_with` | `(T, Completer<U>, &mut TaskSlot)`     |
//! | `catch[_with]`         | `Error -> Result<()>`                  |
//! | `finally[_on]`         | `FnOnce()` pass-through                |
//!
//! The `_with` variants that re-supply the stage input on retry require
//! `T: Clone`.

use std::sync::Arc;

use crate::cancelable::TaskSlot;
use crate::error::{Error, Result};
use crate::monitor::PendingGuard;
use crate::scheduler::{self, QueueId};

use super::{stage, Completer, Driver, Promise, StageOptions};

impl<T: Send + 'static> Promise<T> {
    /// Transforms the value with a synchronous body on the default queue.
    pub fn then<U: Send + 'static>(
        self,
        body: impl FnOnce(T) -> Result<U> + Send + 'static,
    ) -> Promise<U> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    stage::run_mapped_once(&driver_monitor, &guard, value, body);
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Transforms the value with explicit queue, timeout, and retries.
    pub fn then_with<U: Send + 'static>(
        self,
        options: StageOptions,
        mut body: impl FnMut(T) -> Result<U> + Send + 'static,
    ) -> Promise<U>
    where
        T: Clone,
    {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    stage::run_mapped(
                        &driver_monitor,
                        &guard,
                        options.retry_count(),
                        value,
                        &mut body,
                    );
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Chains a body returning a nested promise; its settlement is
    /// adopted as this stage's settlement.
    ///
    /// The nested promise keeps its own monitor: cancelling this chain
    /// stops forward progression but does not cancel nested work already
    /// in flight.
    pub fn then_flat<U: Send + 'static>(
        self,
        body: impl FnOnce(T) -> Promise<U> + Send + 'static,
    ) -> Promise<U> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    stage::run_flat_once(&driver_monitor, &guard, value, body);
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Nested-promise body with explicit options; each retry constructs a
    /// fresh nested promise.
    pub fn then_flat_with<U: Send + 'static>(
        self,
        options: StageOptions,
        mut body: impl FnMut(T) -> Promise<U> + Send + 'static,
    ) -> Promise<U>
    where
        T: Clone,
    {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    stage::run_flat(
                        &driver_monitor,
                        &guard,
                        options.retry_count(),
                        value,
                        &mut body,
                    );
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Chains a producer body settling through a [`Completer`].
    pub fn then_async<U: Send + 'static>(
        self,
        body: impl FnOnce(T, Completer<U>) + Send + 'static,
    ) -> Promise<U> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    stage::run_producer_once(&driver_monitor, &guard, move |completer, _slot| {
                        body(value, completer);
                    });
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Producer body with explicit options; each attempt receives the
    /// input again and a fresh completer.
    pub fn then_async_with<U: Send + 'static>(
        self,
        options: StageOptions,
        body: impl Fn(T, Completer<U>) + Send + 'static,
    ) -> Promise<U>
    where
        T: Clone,
    {
        self.then_cancelable_with(options, move |value, completer, _slot| {
            body(value, completer);
        })
    }

    /// Producer body that may hand the monitor a wrapped [`Cancelable`]
    /// task through the slot.
    ///
    /// [`Cancelable`]: crate::Cancelable
    pub fn then_cancelable_with<U: Send + 'static>(
        self,
        options: StageOptions,
        body: impl Fn(T, Completer<U>, &mut TaskSlot) + Send + 'static,
    ) -> Promise<U>
    where
        T: Clone,
    {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<U> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            self.run(Box::new(move |result| match result {
                Err(error) => {
                    guard.settle(Err(error));
                }
                Ok(value) => scheduler::dispatch(options.queue(), move || {
                    let attempt = move |completer: Completer<U>, slot: &mut TaskSlot| {
                        body(value.clone(), completer, slot);
                    };
                    stage::run_producer(&driver_monitor, &guard, options.retry_count(), &attempt);
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Handles an upstream error. The handler consumes the error
    /// (`Ok(())`) or rethrows; upstream success passes through without
    /// invoking it.
    ///
    /// The handler also runs for `Cancelled` errors: a chain's `catch` is
    /// how cancellation becomes observable to user code.
    pub fn catch(self, handler: impl FnOnce(Error) -> Result<()> + Send + 'static) -> Promise<()> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let options = StageOptions::new();
        let driver: Driver<()> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            self.run(Box::new(move |result| match result {
                Ok(_) => {
                    guard.settle(Ok(()));
                }
                Err(error) => scheduler::dispatch(options.queue(), move || {
                    stage::run_handler_once(&driver_monitor, &guard, error, handler);
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Error handler with explicit queue, timeout, and retries.
    pub fn catch_with(
        self,
        options: StageOptions,
        mut handler: impl FnMut(Error) -> Result<()> + Send + 'static,
    ) -> Promise<()> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<()> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            stage::arm_timeout(&guard, options.timeout_value());
            self.run(Box::new(move |result| match result {
                Ok(_) => {
                    guard.settle(Ok(()));
                }
                Err(error) => scheduler::dispatch(options.queue(), move || {
                    stage::run_handler(
                        &driver_monitor,
                        &guard,
                        options.retry_count(),
                        error,
                        &mut handler,
                    );
                }),
            }));
        });
        Promise::from_driver(monitor, driver)
    }

    /// Runs a handler after the stage settles, forwarding the upstream
    /// result unchanged. The handler runs even when the chain was
    /// cancelled.
    pub fn finally(self, handler: impl FnOnce() + Send + 'static) -> Promise<T> {
        self.finally_on(QueueId::Default, handler)
    }

    /// Like [`Promise::finally`], on an explicit queue.
    pub fn finally_on(self, queue: QueueId, handler: impl FnOnce() + Send + 'static) -> Promise<T> {
        self.cancel_autorun();
        let monitor = self.monitor_handle();
        let driver_monitor = Arc::clone(&monitor);
        let driver: Driver<T> = Box::new(move |complete| {
            let guard = PendingGuard::arm(Arc::clone(&driver_monitor), complete);
            self.run(Box::new(move |result| {
                scheduler::dispatch(queue, move || {
                    // Honor suspension; a cancelled chain still runs the
                    // handler and forwards the original result.
                    let _ = driver_monitor.wait();
                    handler();
                    guard.settle(result);
                });
            }));
        });
        Promise::from_driver(monitor, driver)
    }
}
