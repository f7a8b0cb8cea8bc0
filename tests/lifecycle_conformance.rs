//! Lifecycle conformance: cancellation, suspension, exactly-once
//! settlement, and the leak-detection seam.
//!
//! - **Exactly-once**: at most one settlement per stage latches, under
//!   contention from many producers
//! - **Idempotence**: `suspend; suspend` ≡ `suspend`, `cancel; cancel` ≡
//!   `cancel`, unpaired `resume` is a no-op
//! - **Dominance**: cancellation wins over resume and over any pending
//!   user settlement
//! - **Replay**: a task installed after suspend/cancel receives that
//!   signal immediately
//! - **Deinit**: the monitor's drop hook fires exactly once

mod common;

use common::*;
use promisync::{Error, Promise, StageOptions};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn suspend_pauses_downstream_and_resume_releases() {
    init_logging();

    let stage_ran = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&stage_ran);

    let chain = Promise::resolved(1).then(move |v| {
        s.store(true, Ordering::SeqCst);
        Ok(v + 1)
    });
    chain.suspend();

    let probe = chain.clone();
    let joiner = thread::spawn(move || probe.join());

    thread::sleep(Duration::from_millis(60));
    assert!(
        !stage_ran.load(Ordering::SeqCst),
        "stage body ran while suspended"
    );

    chain.resume();
    let value = joiner.join().expect("joiner panicked").expect("rejected");
    assert_eq!(value, 2);
    assert!(stage_ran.load(Ordering::SeqCst));
}

#[test]
fn cancel_dominates_resume_and_is_idempotent() {
    init_logging();

    let promise = Promise::<i32>::deferred(|_completer| {});
    promise.cancel();
    promise.cancel();
    promise.resume();

    assert!(promise.is_cancelled());
    let err = promise.join().expect_err("cancelled chain resolved");
    assert!(err.is_cancelled());
}

#[test]
fn cancel_before_drive_skips_every_body() {
    init_logging();

    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);

    let promise = Promise::resolved(5);
    promise.cancel();
    let err = promise
        .then(move |v| {
            r.store(true, Ordering::SeqCst);
            Ok(v)
        })
        .join()
        .expect_err("cancelled chain resolved");

    assert!(err.is_cancelled());
    assert!(!ran.load(Ordering::SeqCst), "body ran on a cancelled chain");
}

#[test]
fn lifecycle_ops_forward_to_wrapped_task_once() {
    init_logging();

    let task = CountingTask::new();
    let install = Arc::clone(&task);

    let promise = Promise::<i32>::cancelable(move |_completer, slot| {
        slot.install_shared(install);
    });

    let probe = promise.clone();
    let joiner = thread::spawn(move || probe.join_timeout(Duration::from_secs(5)));

    wait_until(Duration::from_secs(2), "task installation", || {
        // The body has run once the producer stage installed the task;
        // suspend forwarding is the observable.
        promise.suspend();
        promise.resume();
        task.suspends.load(Ordering::SeqCst) > 0
    });

    promise.suspend();
    promise.suspend();
    promise.resume();
    promise.resume();
    promise.cancel();
    promise.cancel();

    assert_eq!(task.cancels.load(Ordering::SeqCst), 1);
    assert!(joiner.join().expect("joiner panicked").is_some());
}

#[test]
fn task_installed_after_cancel_is_cancelled_immediately() {
    init_logging();

    let task = CountingTask::new();
    let monitor = promisync::ChainMonitor::new();
    monitor.cancel();
    let installed: Arc<dyn promisync::Cancelable> = task.clone();
    monitor.install_task(installed);

    assert_eq!(task.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(task.suspends.load(Ordering::SeqCst), 0);
}

#[test]
fn settlement_is_exactly_once_under_contention() {
    init_logging();

    let observed = Arc::new(AtomicUsize::new(0));
    let o = Arc::clone(&observed);

    let value = Promise::deferred(|completer| {
        for n in 0..8 {
            let completer = completer.clone();
            thread::spawn(move || {
                completer.resolve(n);
            });
        }
    })
    .then(move |v| {
        o.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    })
    .join()
    .expect("rejected");

    assert!(value < 8);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        observed.load(Ordering::SeqCst),
        1,
        "stage body observed more than one settlement"
    );
}

#[test]
fn deinit_hook_fires_exactly_once() {
    init_logging();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let promise = Promise::resolved(1).then(|v| Ok(v + 1));
        let f = Arc::clone(&fired);
        promise.monitor_handle().install_on_deinit(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(promise.clone().join().expect("rejected"), 2);
    }

    wait_until(Duration::from_secs(2), "deinit hook", || {
        fired.load(Ordering::SeqCst) == 1
    });
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn join_timeout_leaves_the_chain_running() {
    init_logging();

    let finished = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&finished);

    let promise = Promise::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        f.store(true, Ordering::SeqCst);
        Ok(())
    });

    assert!(promise.join_timeout(Duration::from_millis(20)).is_none());
    wait_until(Duration::from_secs(2), "background completion", || {
        finished.load(Ordering::SeqCst)
    });
}

#[test]
fn cancellation_breaks_a_retry_loop() {
    init_logging();

    let attempts = Arc::new(AtomicUsize::new(0));
    let a = Arc::clone(&attempts);

    let promise = Promise::<i32>::spawn_with(StageOptions::new().retries(50), move || {
        a.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        Err(Error::user("keep trying"))
    });

    let probe = promise.clone();
    let joiner = thread::spawn(move || probe.join());
    thread::sleep(Duration::from_millis(70));
    promise.cancel();

    let err = joiner
        .join()
        .expect("joiner panicked")
        .expect_err("flaky body resolved");
    assert!(err.is_cancelled());

    let made = attempts.load(Ordering::SeqCst);
    assert!(made < 20, "retry loop ignored cancellation ({made} attempts)");
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn retry_budget_bounds_attempts(retries in 0u32..4, failures in 0u32..6) {
        init_logging();

        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let result = Promise::spawn_with(StageOptions::new().retries(retries), move || {
            let n = a.fetch_add(1, Ordering::SeqCst) as u32 + 1;
            if n <= failures {
                Err(Error::user("transient"))
            } else {
                Ok(n)
            }
        })
        .join();

        let made = attempts.load(Ordering::SeqCst) as u32;
        if failures <= retries {
            prop_assert!(result.is_ok());
            prop_assert_eq!(made, failures + 1);
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(made, retries + 1);
        }
    }
}
