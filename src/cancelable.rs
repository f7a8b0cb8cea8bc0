//! The `Cancelable` capability for wrapped asynchronous tasks.
//!
//! A stage body that starts work the library cannot see (a download, a
//! timer, a custom worker) hands the monitor a handle implementing
//! [`Cancelable`]. The monitor then forwards `suspend`/`resume`/`cancel`
//! from the chain to the wrapped work, so lifecycle control reaches into
//! the stage that is currently in flight.
//!
//! Implementations must tolerate repeated and unpaired calls: the monitor
//! guarantees idempotent `cancel` at its own level but replays a pending
//! `suspend` or `cancel` onto a freshly installed task.

use std::sync::Arc;

/// Lifecycle capability set for a wrapped asynchronous task.
pub trait Cancelable: Send + Sync {
    /// Pauses the wrapped work. Must be safe to call repeatedly.
    fn suspend(&self);

    /// Resumes the wrapped work after a suspend. Unpaired resumes are
    /// no-ops.
    fn resume(&self);

    /// Cancels the wrapped work. Must be idempotent; the task will not
    /// receive further lifecycle calls afterwards.
    fn cancel(&self);
}

/// Slot a cancelable-producer body writes its task into.
///
/// The slot is handed to the body by value reference; after the body
/// returns, the promise machinery drains it into the chain monitor.
#[derive(Default)]
pub struct TaskSlot {
    task: Option<Arc<dyn Cancelable>>,
}

impl TaskSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a task, replacing any previous one.
    pub fn install(&mut self, task: impl Cancelable + 'static) {
        self.task = Some(Arc::new(task));
    }

    /// Installs an already-shared task, replacing any previous one.
    pub fn install_shared(&mut self, task: Arc<dyn Cancelable>) {
        self.task = Some(task);
    }

    /// Returns true if a task has been installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn take(&mut self) -> Option<Arc<dyn Cancelable>> {
        self.task.take()
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot")
            .field("installed", &self.task.is_some())
            .finish()
    }
}
