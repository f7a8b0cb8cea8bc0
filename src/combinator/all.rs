//! The `all` and `all_settled` aggregators.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::monitor::PendingGuard;
use crate::promise::{Driver, Promise};

use super::parent_monitor;

/// Resolves with every member's value, ordered by member index, once all
/// members fulfill.
///
/// Fail-fast: the first member failure rejects the parent immediately;
/// the remaining members keep running but their results are discarded.
/// No members resolves to an empty vector.
pub fn all<T: Send + 'static>(members: Vec<Promise<T>>) -> Promise<Vec<T>> {
    if members.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let monitor = parent_monitor(&members);
    let driver_monitor = Arc::clone(&monitor);
    let driver: Driver<Vec<T>> = Box::new(move |complete| {
        let guard = PendingGuard::arm(driver_monitor, complete);
        let expected = members.len();
        let settled: Arc<Mutex<BTreeMap<usize, T>>> = Arc::new(Mutex::new(BTreeMap::new()));

        for (index, member) in members.into_iter().enumerate() {
            let guard = guard.clone();
            let settled = Arc::clone(&settled);
            member.run(Box::new(move |result| match result {
                Ok(value) => {
                    let values = {
                        let mut map = settled.lock().unwrap();
                        map.insert(index, value);
                        if map.len() == expected {
                            Some(std::mem::take(&mut *map).into_values().collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = values {
                        guard.settle(Ok(values));
                    }
                }
                Err(error) => {
                    guard.settle(Err(error));
                }
            }));
        }
    });
    Promise::from_driver(monitor, driver)
}

/// Resolves with every member's settlement, ordered by member index, once
/// all members settle. Never rejects; member failures arrive as `Err`
/// entries in the result vector.
pub fn all_settled<T: Send + 'static>(members: Vec<Promise<T>>) -> Promise<Vec<Result<T>>> {
    if members.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let monitor = parent_monitor(&members);
    let driver_monitor = Arc::clone(&monitor);
    let driver: Driver<Vec<Result<T>>> = Box::new(move |complete| {
        let guard = PendingGuard::arm(driver_monitor, complete);
        let expected = members.len();
        let settled: Arc<Mutex<BTreeMap<usize, Result<T>>>> = Arc::new(Mutex::new(BTreeMap::new()));

        for (index, member) in members.into_iter().enumerate() {
            let guard = guard.clone();
            let settled = Arc::clone(&settled);
            member.run(Box::new(move |result| {
                let results = {
                    let mut map = settled.lock().unwrap();
                    map.insert(index, result);
                    if map.len() == expected {
                        Some(std::mem::take(&mut *map).into_values().collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                if let Some(results) = results {
                    guard.settle(Ok(results));
                }
            }));
        }
    });
    Promise::from_driver(monitor, driver)
}
