//! Fan-out lifecycle control over a set of member monitors.

use std::sync::Arc;
use tracing::trace;

use crate::cancelable::Cancelable;

/// A [`Cancelable`] that forwards every lifecycle operation to each
/// member, in member order.
///
/// Installed as the wrapped task of an aggregator's parent promise, so
/// suspending, resuming, or cancelling the parent reaches every member
/// chain. Individual members tolerate the replay rules of their own
/// monitors (idempotent cancel, unpaired resume is a no-op), so the
/// fan-out needs no state of its own.
pub struct AggregateTask {
    members: Vec<Arc<dyn Cancelable>>,
}

impl AggregateTask {
    /// Builds the fan-out over the given members.
    #[must_use]
    pub fn new(members: Vec<Arc<dyn Cancelable>>) -> Self {
        Self { members }
    }

    /// Number of members controlled by this task.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true when there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Cancelable for AggregateTask {
    fn suspend(&self) {
        trace!(members = self.members.len(), "suspending aggregate");
        for member in &self.members {
            member.suspend();
        }
    }

    fn resume(&self) {
        trace!(members = self.members.len(), "resuming aggregate");
        for member in &self.members {
            member.resume();
        }
    }

    fn cancel(&self) {
        trace!(members = self.members.len(), "cancelling aggregate");
        for member in &self.members {
            member.cancel();
        }
    }
}

impl std::fmt::Debug for AggregateTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateTask")
            .field("members", &self.members.len())
            .finish()
    }
}
