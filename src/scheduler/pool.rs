//! Labelled worker pools backing the bundled scheduler.
//!
//! One pool per [`QueueId`]: the main pool is serial (one worker), the
//! quality-of-service pools are concurrent. Workers pull from a lock-free
//! injection queue and park on a condvar when it runs dry. A work item
//! that panics is contained; the worker survives.
//!
//! Shutdown is graceful: pending work drains, then workers exit and are
//! joined with a bounded timeout.

use crossbeam_queue::SegQueue;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::timer::TimerThread;
use super::{QueueId, Scheduler, SchedulerError, Work};

/// Worker count used when the host refuses to report its parallelism.
const FALLBACK_WORKER_COUNT: usize = 2;

const QUEUE_COUNT: usize = QueueId::ALL.len();

thread_local! {
    static CURRENT_QUEUE: Cell<Option<QueueId>> = Cell::new(None);
}

/// Configuration for a [`PoolScheduler`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker count for each concurrent pool. The main pool always has
    /// exactly one worker.
    pub concurrent_workers: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl PoolConfig {
    /// Creates a config with detected parallelism and the default name
    /// prefix.
    #[must_use]
    pub fn new() -> Self {
        let detected = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(FALLBACK_WORKER_COUNT);
        Self {
            concurrent_workers: detected.max(FALLBACK_WORKER_COUNT),
            thread_name_prefix: "promisync".to_string(),
        }
    }

    /// Sets the worker count for the concurrent pools.
    #[must_use]
    pub fn with_concurrent_workers(mut self, workers: usize) -> Self {
        self.concurrent_workers = workers.max(1);
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The bundled scheduler: one worker pool per queue label plus a timer
/// thread for delayed dispatch.
pub struct PoolScheduler {
    pools: Arc<PoolSet>,
    timer: TimerThread,
}

impl PoolScheduler {
    /// Creates a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Creates a scheduler from an explicit configuration.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        let pools = Arc::new(PoolSet::new(&config));
        let timer = TimerThread::start(Arc::clone(&pools), &config.thread_name_prefix);
        Self { pools, timer }
    }

    /// Returns the number of queued-but-unstarted work items on a pool.
    #[must_use]
    pub fn pending_count(&self, queue: QueueId) -> usize {
        self.pools.pool(queue).pending_count()
    }

    /// Returns the worker count of a pool.
    #[must_use]
    pub fn worker_count(&self, queue: QueueId) -> usize {
        self.pools.pool(queue).worker_count()
    }

    /// Initiates shutdown: pools stop accepting work, pending work drains.
    pub fn shutdown(&self) {
        self.timer.shutdown();
        self.pools.shutdown_all();
    }

    /// Shuts down and joins every worker, bounded by `timeout`.
    ///
    /// Returns true when everything exited within the bound.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.shutdown();
        let timer_done = self.timer.join(deadline.saturating_duration_since(Instant::now()));
        let pools_done = self
            .pools
            .join_all(deadline.saturating_duration_since(Instant::now()));
        timer_done && pools_done
    }
}

impl Default for PoolScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PoolScheduler {
    fn submit(&self, queue: QueueId, work: Work) {
        if let Err(err) = self.pools.pool(queue).push(work) {
            warn!(queue = %queue, error = %err, "dropping work submitted after shutdown");
        }
    }

    fn submit_after(&self, queue: QueueId, delay: Duration, work: Work) -> super::DelayHandle {
        self.timer.schedule(queue, delay, work)
    }

    fn current_queue_id(&self) -> Option<QueueId> {
        CURRENT_QUEUE.with(Cell::get)
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl std::fmt::Debug for PoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolScheduler")
            .field("pending_default", &self.pending_count(QueueId::Default))
            .field("pending_main", &self.pending_count(QueueId::Main))
            .finish()
    }
}

/// The fixed set of pools, indexed by [`QueueId`].
pub(crate) struct PoolSet {
    pools: [WorkerPool; QUEUE_COUNT],
}

impl PoolSet {
    fn new(config: &PoolConfig) -> Self {
        let pools = QueueId::ALL.map(|queue| {
            let workers = if queue.is_serial() {
                1
            } else {
                config.concurrent_workers
            };
            WorkerPool::start(queue, workers, &config.thread_name_prefix)
        });
        Self { pools }
    }

    pub(crate) fn pool(&self, queue: QueueId) -> &WorkerPool {
        &self.pools[queue.index()]
    }

    pub(crate) fn submit(&self, queue: QueueId, work: Work) {
        if let Err(err) = self.pool(queue).push(work) {
            warn!(queue = %queue, error = %err, "dropping timer work after shutdown");
        }
    }

    fn shutdown_all(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
    }

    fn join_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.pools
            .iter()
            .all(|pool| pool.join(deadline.saturating_duration_since(Instant::now())))
    }
}

/// A single labelled worker pool.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolInner {
    queue_id: QueueId,
    queue: SegQueue<Work>,
    pending: AtomicUsize,
    shutdown: AtomicBool,
    workers: usize,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WorkerPool {
    fn start(queue_id: QueueId, workers: usize, name_prefix: &str) -> Self {
        let inner = Arc::new(PoolInner {
            queue_id,
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            workers,
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let inner = Arc::clone(&inner);
            let name = format!("{name_prefix}-{queue_id}-{n}");
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    pub(crate) fn push(&self, work: Work) -> Result<(), SchedulerError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        self.inner.queue.push(work);
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_one();
        Ok(())
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.inner.workers
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.condvar.notify_all();
    }

    fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(Duration::from_millis(5));
            }
            let _ = handle.join();
        }
        true
    }
}

fn worker_loop(inner: &PoolInner) {
    CURRENT_QUEUE.with(|current| current.set(Some(inner.queue_id)));
    trace!(queue = %inner.queue_id, "pool worker started");

    loop {
        if let Some(work) = inner.queue.pop() {
            inner.pending.fetch_sub(1, Ordering::Relaxed);
            if catch_unwind(AssertUnwindSafe(work)).is_err() {
                debug!(queue = %inner.queue_id, "work item panicked");
            }
            continue;
        }

        // Drain before exit: shutdown only stops a worker once the queue
        // is observed empty.
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let guard = inner.mutex.lock().unwrap();
        if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            let _guard = inner.condvar.wait(guard).unwrap();
        }
    }

    trace!(queue = %inner.queue_id, "pool worker exited");
}
