//! The `any` aggregator: first fulfillment wins.

use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::monitor::PendingGuard;
use crate::promise::{Driver, Promise};

use super::parent_monitor;

/// Settles with the first member to fulfill. Member failures are
/// collected; when every member has failed the parent rejects with an
/// aggregate error whose causes preserve member-index order. No members
/// rejects with [`ErrorKind::Empty`].
///
/// [`ErrorKind::Empty`]: crate::ErrorKind::Empty
pub fn any<T: Send + 'static>(members: Vec<Promise<T>>) -> Promise<T> {
    if members.is_empty() {
        return Promise::rejected(Error::empty());
    }

    let monitor = parent_monitor(&members);
    let driver_monitor = Arc::clone(&monitor);
    let driver: Driver<T> = Box::new(move |complete| {
        let guard = PendingGuard::arm(driver_monitor, complete);
        let expected = members.len();
        let failures: Arc<Mutex<Vec<Option<Error>>>> =
            Arc::new(Mutex::new(vec![None; expected]));

        for (index, member) in members.into_iter().enumerate() {
            let guard = guard.clone();
            let failures = Arc::clone(&failures);
            member.run(Box::new(move |result| match result {
                Ok(value) => {
                    guard.settle(Ok(value));
                }
                Err(error) => {
                    let aggregate = {
                        let mut slots = failures.lock().unwrap();
                        slots[index] = Some(error);
                        if slots.iter().all(Option::is_some) {
                            Some(slots.iter_mut().filter_map(Option::take).collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(errors) = aggregate {
                        guard.settle(Err(Error::aggregate(errors)));
                    }
                }
            }));
        }
    });
    Promise::from_driver(monitor, driver)
}
