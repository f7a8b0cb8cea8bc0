//! The `race` aggregator: first settlement wins.

use std::sync::Arc;

use crate::error::Error;
use crate::monitor::PendingGuard;
use crate::promise::{Driver, Promise};

use super::parent_monitor;

/// Settles with the first member to settle, value or error alike. The
/// losers keep running untouched; their settlements are dropped by the
/// parent's guard. No members rejects with [`ErrorKind::Empty`].
///
/// [`ErrorKind::Empty`]: crate::ErrorKind::Empty
pub fn race<T: Send + 'static>(members: Vec<Promise<T>>) -> Promise<T> {
    if members.is_empty() {
        return Promise::rejected(Error::empty());
    }

    let monitor = parent_monitor(&members);
    let driver_monitor = Arc::clone(&monitor);
    let driver: Driver<T> = Box::new(move |complete| {
        let guard = PendingGuard::arm(driver_monitor, complete);
        for member in members {
            let guard = guard.clone();
            member.run(Box::new(move |result| {
                guard.settle(result);
            }));
        }
    });
    Promise::from_driver(monitor, driver)
}
