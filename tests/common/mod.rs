#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use promisync::{Cancelable, Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Installs the test tracing subscriber once per process.
///
/// Controlled by `RUST_LOG`; defaults to quiet.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spins until `predicate` holds, panicking after `deadline`.
pub fn wait_until(deadline: Duration, what: &str, predicate: impl Fn() -> bool) {
    let limit = Instant::now() + deadline;
    while !predicate() {
        assert!(Instant::now() < limit, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Resolves `value` on another thread after `delay`.
pub fn resolve_after<T: Send + 'static>(value: T, delay: Duration) -> promisync::Promise<T> {
    promisync::Promise::deferred(move |completer| {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            completer.resolve(value);
        });
    })
}

/// Rejects with `error` on another thread after `delay`.
pub fn reject_after<T: Send + 'static>(error: Error, delay: Duration) -> promisync::Promise<T> {
    promisync::Promise::deferred(move |completer| {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            completer.reject(error);
        });
    })
}

/// A `Cancelable` double counting every lifecycle call it receives.
#[derive(Debug, Default)]
pub struct CountingTask {
    pub suspends: AtomicUsize,
    pub resumes: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl CountingTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
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

/// Records chain settlements for later assertion.
#[derive(Debug, Default)]
pub struct SettleRecorder<T> {
    settlements: Mutex<Vec<Result<T>>>,
}

impl<T: Clone> SettleRecorder<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            settlements: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self, result: Result<T>) {
        self.settlements.lock().unwrap().push(result);
    }

    pub fn count(&self) -> usize {
        self.settlements.lock().unwrap().len()
    }

    pub fn first(&self) -> Option<Result<T>> {
        self.settlements.lock().unwrap().first().cloned()
    }
}
