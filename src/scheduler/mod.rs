//! The scheduling seam the promise machinery runs on.
//!
//! The library owns no event loop. Every stage body is a unit of work
//! handed to a [`Scheduler`]: an abstraction over a set of labelled worker
//! pools with a delayed-dispatch primitive. The bundled [`PoolScheduler`]
//! is the production implementation; anything satisfying the trait can be
//! installed in its place before first use.
//!
//! # Contract
//!
//! - `submit` executes the work exactly once, never synchronously inside
//!   the submitting call.
//! - `submit_after` executes the work exactly once after the delay, unless
//!   the returned [`DelayHandle`] wins the cancellation race first.
//! - `current_queue_id` identifies the pool of the calling thread, which
//!   lets stage dispatch take the same-queue synchronous fast path.

mod pool;
mod timer;

pub use pool::{PoolConfig, PoolScheduler};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A unit of work submitted to a pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Identifier for a worker pool.
///
/// `Main` is serial (a single worker, submission order preserved); the
/// remaining pools are concurrent quality-of-service tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// The serial main pool.
    Main,
    /// The default pool for unspecified stage work.
    Default,
    /// Latency-sensitive work.
    UserInitiated,
    /// Deadline-tolerant work; also hosts timeout firings.
    Utility,
    /// Throughput work that should never crowd out the other tiers.
    Background,
}

impl QueueId {
    /// Every pool, in fixed order.
    pub const ALL: [Self; 5] = [
        Self::Main,
        Self::Default,
        Self::UserInitiated,
        Self::Utility,
        Self::Background,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Default => 1,
            Self::UserInitiated => 2,
            Self::Utility => 3,
            Self::Background => 4,
        }
    }

    /// Returns true for the serial pool.
    #[must_use]
    pub fn is_serial(self) -> bool {
        matches!(self, Self::Main)
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Default => write!(f, "default"),
            Self::UserInitiated => write!(f, "user-initiated"),
            Self::Utility => write!(f, "utility"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Errors surfaced by the scheduler layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// A scheduler was already installed (or lazily defaulted) for this
    /// process.
    #[error("a scheduler is already installed")]
    AlreadyInstalled,
    /// The scheduler has been shut down and no longer accepts work.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// The work-scheduling facility consumed by the promise machinery.
pub trait Scheduler: Send + Sync {
    /// Enqueues `work` on the pool identified by `queue`.
    ///
    /// Must not run `work` synchronously inside the call. Ordering between
    /// submissions is guaranteed only on serial pools.
    fn submit(&self, queue: QueueId, work: Work);

    /// Schedules `work` on `queue` after `delay`.
    ///
    /// The returned handle cancels the dispatch if it wins the race
    /// against firing.
    fn submit_after(&self, queue: QueueId, delay: Duration, work: Work) -> DelayHandle;

    /// Identifies the pool the calling thread belongs to, if any.
    fn current_queue_id(&self) -> Option<QueueId>;
}

const DELAY_PENDING: u8 = 0;
const DELAY_FIRED: u8 = 1;
const DELAY_CANCELLED: u8 = 2;

/// Handle to a delayed dispatch.
///
/// Exactly one of the firing path and `cancel` wins; the loser observes
/// that it lost and does nothing.
#[derive(Debug, Clone)]
pub struct DelayHandle {
    state: Arc<AtomicU8>,
}

impl DelayHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(DELAY_PENDING)),
        }
    }

    /// Cancels the dispatch. Returns true only if cancellation won the
    /// race against firing.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                DELAY_PENDING,
                DELAY_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns true once `cancel` has won.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELAY_CANCELLED
    }

    /// Claims the right to fire. The timer calls this exactly once per
    /// entry; false means cancellation won.
    pub(crate) fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(
                DELAY_PENDING,
                DELAY_FIRED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

static GLOBAL: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();

/// Installs the process-wide scheduler.
///
/// Fails if a scheduler was already installed, including the lazily
/// created default; install before constructing the first promise.
pub fn install(scheduler: Arc<dyn Scheduler>) -> Result<(), SchedulerError> {
    GLOBAL
        .set(scheduler)
        .map_err(|_| SchedulerError::AlreadyInstalled)
}

/// Returns the process-wide scheduler, creating the default
/// [`PoolScheduler`] on first use.
pub fn global() -> Arc<dyn Scheduler> {
    GLOBAL
        .get_or_init(|| Arc::new(PoolScheduler::new()) as Arc<dyn Scheduler>)
        .clone()
}

/// Runs `work` on `queue`, taking the same-queue synchronous fast path
/// when the calling thread already belongs to that pool.
pub(crate) fn dispatch(queue: QueueId, work: impl FnOnce() + Send + 'static) {
    let scheduler = global();
    if scheduler.current_queue_id() == Some(queue) {
        work();
    } else {
        scheduler.submit(queue, Box::new(work));
    }
}
