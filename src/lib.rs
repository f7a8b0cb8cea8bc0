//! Promisync: chainable, pool-scheduled promises with lifecycle control.
//!
//! # Overview
//!
//! Promisync composes asynchronous operations as chains of stages. Each
//! stage runs on a labelled worker pool and may be a synchronous
//! computation, a callback producer, or a nested promise; every stage can
//! carry its own timeout and retry budget. One monitor per chain carries
//! lifecycle control the other way: suspend pauses downstream work,
//! cancel interrupts everything not yet started plus whatever cancelable
//! task the current stage wrapped.
//!
//! # Core Guarantees
//!
//! - **Exactly-once settlement**: each stage's completion latches once;
//!   concurrent resolve/reject attempts race and the losers are dropped
//! - **Cancel-correctness**: cancellation is monotone, idempotent, and
//!   observable before any downstream stage body starts
//! - **Suspension pauses, never aborts**: in-flight bodies run to
//!   completion; only forward progression waits on the gate
//! - **Advisory timeouts**: a timeout settles the stage promptly but
//!   never unwinds user code
//! - **No event loop**: the library is a thin layer over an injected
//!   scheduler (labelled pools + delayed dispatch)
//!
//! # Module Structure
//!
//! - [`error`]: the closed settlement-error taxonomy
//! - [`scheduler`]: the scheduling seam and the bundled pool scheduler
//! - [`monitor`]: per-chain lifecycle controller and settlement guards
//! - [`cancelable`]: the capability wrapped tasks implement
//! - [`promise`]: the promise value, constructors, and chain operators
//! - [`combinator`]: `all`, `all_settled`, `race`, `any`
//!
//! # Example
//!
//! ```
//! use promisync::Promise;
//!
//! let value = Promise::resolved(200)
//!     .then(|v| Ok(v / 10))
//!     .then_flat(|v| Promise::resolved(v * 2))
//!     .then(|v| Ok(v * 10))
//!     .join()
//!     .expect("chain rejected");
//! assert_eq!(value, 400);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod cancelable;
pub mod combinator;
pub mod error;
pub mod monitor;
pub mod promise;
pub mod scheduler;

mod sync;

// Re-exports for convenient access to the core surface
pub use cancelable::{Cancelable, TaskSlot};
pub use combinator::{all, all_settled, any, race, AggregateTask};
pub use error::{Error, ErrorKind, Result};
pub use monitor::ChainMonitor;
pub use promise::{Completer, Promise, StageOptions};
pub use scheduler::{
    DelayHandle, PoolConfig, PoolScheduler, QueueId, Scheduler, SchedulerError, Work,
};
