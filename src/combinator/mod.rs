//! Multi-promise aggregators: `all`, `all_settled`, `race`, `any`.
//!
//! Every aggregator follows the same skeleton: cancel each member's
//! autorun at construction (the aggregator drives them), install an
//! [`AggregateTask`] as the parent's wrapped task so lifecycle control
//! fans out to the member monitors, then record per-member settlements
//! under one mutex keyed by member index.
//!
//! Cancelling the parent cancels every member; each member's `Cancelled`
//! settlement is then observed by the per-member callback like any other
//! settlement. The pool a parent's completion runs on is unspecified.

mod aggregate;
mod all;
mod any;
mod race;

pub use aggregate::AggregateTask;
pub use all::{all, all_settled};
pub use any::any;
pub use race::race;

use std::sync::Arc;

use crate::cancelable::Cancelable;
use crate::monitor::ChainMonitor;
use crate::promise::Promise;

impl<T: Send + 'static> Promise<T> {
    /// See [`all`].
    #[must_use]
    pub fn all(members: Vec<Promise<T>>) -> Promise<Vec<T>> {
        all(members)
    }

    /// See [`all_settled`].
    #[must_use]
    pub fn all_settled(members: Vec<Promise<T>>) -> Promise<Vec<crate::Result<T>>> {
        all_settled(members)
    }

    /// See [`race`].
    #[must_use]
    pub fn race(members: Vec<Promise<T>>) -> Promise<T> {
        race(members)
    }

    /// See [`any`].
    #[must_use]
    pub fn any(members: Vec<Promise<T>>) -> Promise<T> {
        any(members)
    }
}

/// Shared aggregator setup: cancels member autoruns and builds the parent
/// monitor with the fan-out task installed.
fn parent_monitor<T: Send + 'static>(members: &[Promise<T>]) -> Arc<ChainMonitor> {
    for member in members {
        member.cancel_autorun();
    }
    let monitor = Arc::new(ChainMonitor::new());
    let task = AggregateTask::new(
        members
            .iter()
            .map(|member| -> Arc<dyn Cancelable> { member.monitor_handle() })
            .collect(),
    );
    monitor.install_task(Arc::new(task));
    monitor
}
